//! Canonical webhook event taxonomy

use std::fmt::{self, Display, Formatter};

use postbox_common::{LogStatus, MessageStatus};
use serde::{Deserialize, Serialize};

/// The engine's own event vocabulary, independent of any provider.
///
/// Deliverability events describe whether a message reached its destination;
/// engagement events describe recipient interaction after delivery; account
/// events are rare, high-severity, non-per-message conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    // Deliverability
    Accepted,
    Delivered,
    Deferred,
    HardBounce,
    SoftBounce,
    Rejected,
    // Engagement
    Open,
    Click,
    SpamComplaint,
    Unsubscribe,
    Resubscribe,
    // Account-level
    AccountSuspended,
}

impl Event {
    #[must_use]
    pub const fn is_engagement(self) -> bool {
        matches!(
            self,
            Self::Open | Self::Click | Self::SpamComplaint | Self::Unsubscribe | Self::Resubscribe
        )
    }

    #[must_use]
    pub const fn is_account_level(self) -> bool {
        matches!(self, Self::AccountSuspended)
    }

    /// The message status a deliverability event maps to, `None` for events
    /// that never drive a message status on their own.
    #[must_use]
    pub const fn message_status(self) -> Option<MessageStatus> {
        match self {
            Self::Accepted => Some(MessageStatus::Queued),
            Self::Delivered => Some(MessageStatus::Sent),
            Self::Deferred => Some(MessageStatus::Requeued),
            Self::HardBounce | Self::SoftBounce | Self::Rejected => Some(MessageStatus::Failed),
            // Engagement implies earlier delivery; the reconciler promotes
            // to sent through its own path.
            Self::Open | Self::Click | Self::SpamComplaint | Self::Unsubscribe
            | Self::Resubscribe => Some(MessageStatus::Sent),
            Self::AccountSuspended => None,
        }
    }

    /// The status recorded on the log entry for this event.
    ///
    /// Not necessarily the message's new status: a deferral acknowledges the
    /// attempt (sent-equivalent severity) while the message itself is
    /// requeued.
    #[must_use]
    pub const fn log_status(self) -> LogStatus {
        match self {
            Self::HardBounce | Self::SoftBounce | Self::Rejected | Self::AccountSuspended => {
                LogStatus::Failed
            }
            _ => LogStatus::Sent,
        }
    }
}

impl Display for Event {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Accepted => "accepted",
            Self::Delivered => "delivered",
            Self::Deferred => "deferred",
            Self::HardBounce => "hard_bounce",
            Self::SoftBounce => "soft_bounce",
            Self::Rejected => "rejected",
            Self::Open => "open",
            Self::Click => "click",
            Self::SpamComplaint => "spam_complaint",
            Self::Unsubscribe => "unsubscribe",
            Self::Resubscribe => "resubscribe",
            Self::AccountSuspended => "account_suspended",
        };
        write!(fmt, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_logs_as_sent_but_requeues() {
        assert_eq!(Event::Deferred.log_status(), LogStatus::Sent);
        assert_eq!(
            Event::Deferred.message_status(),
            Some(MessageStatus::Requeued)
        );
    }

    #[test]
    fn bounces_log_as_failed() {
        assert_eq!(Event::HardBounce.log_status(), LogStatus::Failed);
        assert_eq!(Event::HardBounce.message_status(), Some(MessageStatus::Failed));
        assert_eq!(Event::SoftBounce.message_status(), Some(MessageStatus::Failed));
    }

    #[test]
    fn classification() {
        assert!(Event::Click.is_engagement());
        assert!(!Event::Delivered.is_engagement());
        assert!(Event::AccountSuspended.is_account_level());
        assert_eq!(Event::AccountSuspended.message_status(), None);
    }
}
