//! Core message model for queued outbound mail

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::ValidationError;

/// Unique identifier for a queued message.
///
/// This is a strongly-typed wrapper so message ids cannot be confused with
/// other string identifiers (correlation tokens, log ids).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Ulid);

impl MessageId {
    /// Generate a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl Display for MessageId {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

/// Unique identifier for a delivery log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogId(Ulid);

impl LogId {
    /// Generate a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl Display for LogId {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

/// The provider-correlation token embedded in an outbound message and echoed
/// back by the provider in webhook events.
///
/// Assigned once at creation and immutable afterwards; webhook reconciliation
/// matches events to messages through this token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    /// Generate a fresh token in RFC 5322 Message-ID form.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("<{}@postbox>", Ulid::new().to_string().to_lowercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Display for CorrelationToken {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

/// Dispatch priority for a queued message.
///
/// Ordered so that `Now` sorts above `High`, `High` above `Medium`, and so
/// on; batch selection orders by descending priority.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    /// Bypass the queue entirely and dispatch at enqueue time.
    Now,
}

impl Display for Priority {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(fmt, "low"),
            Self::Medium => write!(fmt, "medium"),
            Self::High => write!(fmt, "high"),
            Self::Now => write!(fmt, "now"),
        }
    }
}

/// Delivery status of a queued message.
///
/// A draft carries no status at all (`Option::<MessageStatus>::None`) and is
/// never selected for dispatch. `Sent` and `Failed` are terminal: nothing in
/// the engine transitions out of them automatically, only explicit
/// administrative action does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Sent,
    Failed,
    Requeued,
}

impl MessageStatus {
    /// Whether the status admits no further automatic transition.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }

    /// Whether a message in this status may be picked up by batch selection.
    #[must_use]
    pub const fn is_eligible(self) -> bool {
        matches!(self, Self::Queued | Self::Requeued)
    }
}

impl Display for MessageStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(fmt, "queued"),
            Self::Sent => write!(fmt, "sent"),
            Self::Failed => write!(fmt, "failed"),
            Self::Requeued => write!(fmt, "requeued"),
        }
    }
}

/// Reference to a stored template, rendered by an external template engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateRef(pub String);

impl Display for TemplateRef {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

/// Message content: either literal subject/body text, or a template reference
/// with a key-value rendering context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Content {
    Literal {
        subject: String,
        body: String,
        html_body: Option<String>,
    },
    Template {
        template: TemplateRef,
        context: BTreeMap<String, String>,
    },
}

impl Default for Content {
    fn default() -> Self {
        Self::Literal {
            subject: String::new(),
            body: String::new(),
            html_body: None,
        }
    }
}

/// Reference to an attachment stored outside the engine.
///
/// Only the name and storage key travel with the message; the bytes live in
/// external attachment storage and are resolved by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub name: String,
    pub storage_key: String,
    pub mimetype: Option<String>,
}

/// A unit of outbound mail awaiting (or past) delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub content: Content,
    pub priority: Priority,
    /// `None` means draft: never eligible for dispatch.
    pub status: Option<MessageStatus>,
    /// Not eligible before this instant when set.
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Must not be dispatched after this instant when set.
    pub expires_at: Option<DateTime<Utc>>,
    /// Count of failed attempts so far; `None` until the first failure.
    pub number_of_retries: Option<u32>,
    /// Names which transport configuration to send through.
    pub backend_alias: String,
    pub headers: Vec<(String, String)>,
    pub attachments: Vec<AttachmentRef>,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    /// Immutable provider-correlation token, assigned at creation.
    pub correlation_token: CorrelationToken,
}

impl Message {
    /// Create a new draft message from the given sender, timestamped now.
    ///
    /// The message starts without a status; enqueueing (or an explicit
    /// status) makes it dispatch-eligible.
    #[must_use]
    pub fn new(sender: impl Into<String>) -> Self {
        Self::new_at(sender, Utc::now())
    }

    /// Create a new draft message with an explicit creation instant.
    #[must_use]
    pub fn new_at(sender: impl Into<String>, created: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::generate(),
            sender: sender.into(),
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            content: Content::default(),
            priority: Priority::default(),
            status: None,
            scheduled_time: None,
            expires_at: None,
            number_of_retries: None,
            backend_alias: "default".to_string(),
            headers: Vec::new(),
            attachments: Vec::new(),
            created,
            last_updated: created,
            correlation_token: CorrelationToken::generate(),
        }
    }

    #[must_use]
    pub fn with_to(mut self, to: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.to = to.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_cc(mut self, cc: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.cc = cc.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_bcc(mut self, bcc: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.bcc = bcc.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        if let Content::Literal { subject: s, .. } = &mut self.content {
            *s = subject.into();
        }
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        if let Content::Literal { body: b, .. } = &mut self.content {
            *b = body.into();
        }
        self
    }

    #[must_use]
    pub fn with_html_body(mut self, html: impl Into<String>) -> Self {
        if let Content::Literal { html_body, .. } = &mut self.content {
            *html_body = Some(html.into());
        }
        self
    }

    #[must_use]
    pub fn with_template(
        mut self,
        template: impl Into<String>,
        context: BTreeMap<String, String>,
    ) -> Self {
        self.content = Content::Template {
            template: TemplateRef(template.into()),
            context,
        };
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_scheduled_time(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(at);
        self
    }

    #[must_use]
    pub const fn with_expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    #[must_use]
    pub fn with_backend(mut self, alias: impl Into<String>) -> Self {
        self.backend_alias = alias.into();
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_attachment(mut self, attachment: AttachmentRef) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Validate the message for creation.
    ///
    /// Violations are synchronous creation-time errors, never deferred to
    /// dispatch time.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the sender is empty, no recipient
    /// list has any addressee, or `expires_at` is not strictly after
    /// `scheduled_time` when both are set.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.sender.trim().is_empty() {
            return Err(ValidationError::EmptySender);
        }

        if self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty() {
            return Err(ValidationError::NoRecipients);
        }

        if let (Some(scheduled), Some(expires)) = (self.scheduled_time, self.expires_at)
            && expires <= scheduled
        {
            return Err(ValidationError::ExpiryBeforeSchedule { scheduled, expires });
        }

        Ok(())
    }

    /// Whether the message is past its expiry at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether the message may be selected for dispatch at `now`.
    #[must_use]
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_some_and(MessageStatus::is_eligible)
            && self.scheduled_time.is_none_or(|at| at <= now)
    }
}

/// Status recorded on a delivery log entry.
///
/// This is a coarser vocabulary than [`MessageStatus`]: a log line records
/// whether the attempt (or externally-reported event) acknowledged the
/// message or rejected it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Sent,
    Failed,
}

impl Display for LogStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => write!(fmt, "sent"),
            Self::Failed => write!(fmt, "failed"),
        }
    }
}

/// Append-only record of one dispatch attempt or one externally-reported
/// event. Never mutated or deleted by the engine; these form the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub id: LogId,
    pub message_id: MessageId,
    pub recorded_at: DateTime<Utc>,
    pub status: LogStatus,
    /// Error detail or raw provider payload.
    pub message: String,
    /// Classification of the failure, when one applies.
    pub exception_kind: Option<String>,
}

impl DeliveryLogEntry {
    #[must_use]
    pub fn new(
        message_id: MessageId,
        recorded_at: DateTime<Utc>,
        status: LogStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: LogId::generate(),
            message_id,
            recorded_at,
            status,
            message: message.into(),
            exception_kind: None,
        }
    }

    #[must_use]
    pub fn with_exception_kind(mut self, kind: impl Into<String>) -> Self {
        self.exception_kind = Some(kind.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Now > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn draft_is_never_eligible() {
        let message = Message::new_at("sender@example.com", t0())
            .with_to(["rcpt@example.com"]);
        assert_eq!(message.status, None);
        assert!(!message.is_eligible(t0()));
    }

    #[test]
    fn scheduled_time_gates_eligibility() {
        let mut message = Message::new_at("sender@example.com", t0())
            .with_to(["rcpt@example.com"])
            .with_scheduled_time(t0() + chrono::Duration::minutes(5));
        message.status = Some(MessageStatus::Queued);

        assert!(!message.is_eligible(t0()));
        assert!(message.is_eligible(t0() + chrono::Duration::minutes(5)));
    }

    #[test]
    fn terminal_statuses() {
        assert!(MessageStatus::Sent.is_terminal());
        assert!(MessageStatus::Failed.is_terminal());
        assert!(!MessageStatus::Queued.is_terminal());
        assert!(!MessageStatus::Requeued.is_terminal());
    }

    #[test]
    fn validation_rejects_expiry_before_schedule() {
        let message = Message::new_at("sender@example.com", t0())
            .with_to(["rcpt@example.com"])
            .with_scheduled_time(t0() + chrono::Duration::hours(2))
            .with_expires_at(t0() + chrono::Duration::hours(1));

        assert!(matches!(
            message.validate(),
            Err(ValidationError::ExpiryBeforeSchedule { .. })
        ));
    }

    #[test]
    fn validation_rejects_equal_expiry_and_schedule() {
        let at = t0() + chrono::Duration::hours(1);
        let message = Message::new_at("sender@example.com", t0())
            .with_to(["rcpt@example.com"])
            .with_scheduled_time(at)
            .with_expires_at(at);

        assert!(message.validate().is_err());
    }

    #[test]
    fn validation_rejects_missing_recipients() {
        let message = Message::new_at("sender@example.com", t0());
        assert!(matches!(
            message.validate(),
            Err(ValidationError::NoRecipients)
        ));
    }

    #[test]
    fn validation_accepts_bcc_only() {
        let message = Message::new_at("sender@example.com", t0())
            .with_bcc(["hidden@example.com"]);
        assert!(message.validate().is_ok());
    }

    #[test]
    fn correlation_token_shape() {
        let token = CorrelationToken::generate();
        assert!(token.as_str().starts_with('<'));
        assert!(token.as_str().ends_with("@postbox>"));
    }

    #[test]
    fn expiry_check() {
        let message = Message::new_at("sender@example.com", t0())
            .with_to(["rcpt@example.com"])
            .with_expires_at(t0() + chrono::Duration::minutes(10));

        assert!(!message.is_expired(t0()));
        assert!(message.is_expired(t0() + chrono::Duration::minutes(10)));
        assert!(message.is_expired(t0() + chrono::Duration::minutes(11)));
    }
}
