//! Storage error types

use postbox_common::MessageId;
use thiserror::Error;

/// Errors surfaced by message and lease storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    /// Backend-specific failure (connection loss, constraint violation other
    /// than the lease-uniqueness one, serialization).
    #[error("storage backend error: {0}")]
    Backend(String),
}
