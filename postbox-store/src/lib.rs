//! Storage abstractions for the postbox mail queueing engine
//!
//! This crate defines the durable-storage seams the engine relies on:
//! - [`MessageStore`]: messages and their append-only delivery logs
//! - [`LeaseStore`]: atomic lease rows backing the distributed lock
//!
//! One in-memory backend ships for each, intended for testing and transient
//! deployments; database-backed stores implement the same traits externally.

pub mod error;
pub mod lease;
pub mod memory;
pub mod store;

pub use error::StoreError;
pub use lease::{LeaseStore, LockLease, MemoryLeaseStore, OwnerToken, LOCK_NAME_MAX_LEN};
pub use memory::MemoryMessageStore;
pub use store::{MessageStore, MessageUpdate};

/// Convenience alias used throughout the storage layer.
pub type Result<T> = std::result::Result<T, StoreError>;
