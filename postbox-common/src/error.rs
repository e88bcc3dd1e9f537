//! Creation-time validation errors

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised synchronously when a message is created.
///
/// Validation never happens at dispatch time; a message that made it into
/// the queue is structurally sound.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("sender address must not be empty")]
    EmptySender,

    #[error("message has no recipients in to, cc, or bcc")]
    NoRecipients,

    #[error("expires_at ({expires}) must be strictly after scheduled_time ({scheduled})")]
    ExpiryBeforeSchedule {
        scheduled: DateTime<Utc>,
        expires: DateTime<Utc>,
    },
}
