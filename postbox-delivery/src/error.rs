//! Typed error handling for delivery operations
//!
//! The taxonomy distinguishes:
//! - Permanent failures - the transport definitively rejected the message
//! - Temporary failures - worth another attempt after backoff
//! - System errors - storage or internal problems unrelated to the message
//!
//! For the status machine the distinction is informational: any failed
//! attempt counts as one attempt against the retry budget. The classification
//! is captured verbatim into the delivery log for operators.

use postbox_lock::LockError;
use postbox_store::StoreError;
use thiserror::Error;

use crate::template::TemplateError;
use crate::transport::TransportError;

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Permanent failure: the message as given will never be accepted.
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    /// Temporary failure: retrying with backoff may succeed.
    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    /// System-level error (storage, configuration).
    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Permanent failures.
#[derive(Debug, Error)]
pub enum PermanentError {
    /// The transport rejected the message outright.
    #[error("Message rejected: {0}")]
    MessageRejected(String),

    /// The named template does not exist.
    #[error("Template not found: {0}")]
    TemplateNotFound(String),
}

/// Temporary failures.
#[derive(Debug, Error)]
pub enum TemporaryError {
    /// Opening the transport connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The transport reported a transient send failure.
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// System-level errors.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// No transport is registered under the message's backend alias.
    #[error("Unknown transport backend: {0}")]
    UnknownBackend(String),

    /// Template rendering failed for a reason other than a missing template.
    #[error("Template rendering error: {0}")]
    TemplateRender(String),
}

impl DeliveryError {
    /// The classification name recorded into the delivery log.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Permanent(PermanentError::MessageRejected(_)) => "MessageRejected",
            Self::Permanent(PermanentError::TemplateNotFound(_)) => "TemplateNotFound",
            Self::Temporary(TemporaryError::ConnectionFailed(_)) => "ConnectionFailed",
            Self::Temporary(TemporaryError::SendFailed(_)) => "SendFailed",
            Self::System(SystemError::Store(_)) => "StoreError",
            Self::System(SystemError::UnknownBackend(_)) => "UnknownBackend",
            Self::System(SystemError::TemplateRender(_)) => "TemplateError",
        }
    }

    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Conversion used when a send or connection-open fails: the error feeds the
/// retry policy as one failed attempt either way.
impl From<TransportError> for DeliveryError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Connect(message) => {
                Self::Temporary(TemporaryError::ConnectionFailed(message))
            }
            TransportError::Rejected(message) => {
                Self::Permanent(PermanentError::MessageRejected(message))
            }
            TransportError::Send(message) | TransportError::Closed(message) => {
                Self::Temporary(TemporaryError::SendFailed(message))
            }
        }
    }
}

impl From<TemplateError> for DeliveryError {
    fn from(error: TemplateError) -> Self {
        match error {
            TemplateError::NotFound(name) => {
                Self::Permanent(PermanentError::TemplateNotFound(name))
            }
            TemplateError::Render(message) => {
                Self::System(SystemError::TemplateRender(message))
            }
        }
    }
}

impl From<StoreError> for DeliveryError {
    fn from(error: StoreError) -> Self {
        Self::System(SystemError::Store(error))
    }
}

/// Errors aborting a whole dispatch run.
///
/// Per-message failures never show up here; they are absorbed by the retry
/// policy and reported through counts and logs.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A worker exceeded the batch delivery timeout. The run was aborted and
    /// the dispatch lock released; in-flight sends have unknown outcomes.
    #[error("dispatch run exceeded the batch delivery timeout")]
    BatchTimeout,

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}
