//! Webhook processing errors

use postbox_store::StoreError;
use thiserror::Error;

/// Errors aborting a webhook payload.
///
/// Per-event problems (unknown message, unrecognized kind) are absorbed and
/// logged; only payload-level failures and the account-suspension case
/// surface here.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// The payload shape is unrecognized entirely.
    #[error("malformed webhook payload: {0}")]
    Malformed(String),

    /// The provider reported an account-level suspension. Deliberately loud:
    /// operationally critical and never absorbed per-message.
    #[error("provider reported account suspension: {0}")]
    AccountSuspended(String),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}
