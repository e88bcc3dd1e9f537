//! Shared data model for the postbox mail queueing engine
//!
//! This crate holds the types every other postbox crate agrees on:
//! - The [`Message`] model and its status/priority vocabulary
//! - Append-only [`DeliveryLogEntry`] records
//! - Creation-time validation
//! - Logging initialisation

pub mod error;
pub mod logging;
pub mod model;

pub use error::ValidationError;
pub use model::{
    AttachmentRef, Content, CorrelationToken, DeliveryLogEntry, LogId, LogStatus, Message,
    MessageId, MessageStatus, Priority, TemplateRef,
};
pub use tracing;

/// Signal broadcast to long-running services for coordinated shutdown.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
}
