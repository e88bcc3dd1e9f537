//! Provider event vocabularies
//!
//! Each provider speaks its own event dialect; a [`ProviderVocabulary`]
//! translates one raw provider event into the engine's canonical
//! [`Event`] taxonomy, or declines when the kind is unrecognized.

use chrono::{DateTime, TimeZone, Utc};
use postbox_common::CorrelationToken;
use serde_json::Value;

use crate::error::WebhookError;
use crate::event::Event;

/// One provider event translated into canonical form.
#[derive(Debug, Clone)]
pub struct ProviderEvent {
    pub kind: Event,
    /// The correlation token echoed back for deliverability events.
    pub token: Option<CorrelationToken>,
    /// The provider's own message id, used to match engagement events
    /// against earlier deliverability log payloads.
    pub provider_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    /// The raw event as received, persisted verbatim into the log.
    pub raw: Value,
}

/// Translation table from one provider's webhook dialect.
pub trait ProviderVocabulary: Send + Sync {
    /// Parse a raw webhook body into individual event values.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Malformed`] when the body is not a payload
    /// this provider would send.
    fn parse_payload(&self, body: &[u8]) -> Result<Vec<Value>, WebhookError>;

    /// Translate one raw event, `None` when the event kind is unknown.
    fn translate(&self, raw: &Value) -> Option<ProviderEvent>;
}

/// Vocabulary for Mandrill-style webhook payloads.
///
/// The body is a JSON array of event objects of the shape
/// `{"event": "...", "ts": <unix seconds>, "_id": "...",
/// "msg": {"metadata": {"message_id": "..."}}}`, delivered in reverse
/// chronological order.
#[derive(Debug, Clone, Copy, Default)]
pub struct MandrillVocabulary;

impl MandrillVocabulary {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn kind(name: &str) -> Option<Event> {
        match name {
            "queued" | "send" => Some(Event::Accepted),
            "delivered" => Some(Event::Delivered),
            "deferral" => Some(Event::Deferred),
            "hard_bounce" => Some(Event::HardBounce),
            "soft_bounce" => Some(Event::SoftBounce),
            "reject" => Some(Event::Rejected),
            "open" => Some(Event::Open),
            "click" => Some(Event::Click),
            "spam" => Some(Event::SpamComplaint),
            "unsub" => Some(Event::Unsubscribe),
            "resub" => Some(Event::Resubscribe),
            "blacklist" | "account_suspended" => Some(Event::AccountSuspended),
            _ => None,
        }
    }
}

impl ProviderVocabulary for MandrillVocabulary {
    fn parse_payload(&self, body: &[u8]) -> Result<Vec<Value>, WebhookError> {
        let parsed: Value = serde_json::from_slice(body)
            .map_err(|err| WebhookError::Malformed(err.to_string()))?;

        match parsed {
            Value::Array(events) => Ok(events),
            other => Err(WebhookError::Malformed(format!(
                "expected a JSON array of events, got {other}"
            ))),
        }
    }

    fn translate(&self, raw: &Value) -> Option<ProviderEvent> {
        let kind = Self::kind(raw.get("event")?.as_str()?)?;

        let occurred_at = raw
            .get("ts")
            .and_then(Value::as_i64)
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())?;

        let token = raw
            .get("msg")
            .and_then(|msg| msg.get("metadata"))
            .and_then(|meta| meta.get("message_id"))
            .and_then(Value::as_str)
            .map(CorrelationToken::from);

        let provider_id = raw
            .get("_id")
            .and_then(Value::as_str)
            .map(ToString::to_string);

        Some(ProviderEvent {
            kind,
            token,
            provider_id,
            occurred_at,
            raw: raw.clone(),
        })
    }
}
