//! The message storage trait and targeted-update type

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use postbox_common::{
    CorrelationToken, DeliveryLogEntry, LogId, Message, MessageId, MessageStatus,
};

use crate::Result;

/// A targeted partial update of a message row.
///
/// Every engine mutation goes through this type rather than a full-object
/// save, so concurrent writers (dispatcher, webhook reconciler) never clobber
/// fields they did not mean to touch. In particular `last_updated` only moves
/// when a caller sets it explicitly; there is no auto-touch.
///
/// Fields are doubly optional where the column itself is nullable: the outer
/// `Option` is "include this field in the update", the inner one is the value
/// to write.
#[derive(Debug, Clone, Default)]
pub struct MessageUpdate {
    pub status: Option<Option<MessageStatus>>,
    pub scheduled_time: Option<Option<DateTime<Utc>>>,
    pub number_of_retries: Option<u32>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl MessageUpdate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn status(mut self, status: MessageStatus) -> Self {
        self.status = Some(Some(status));
        self
    }

    #[must_use]
    pub const fn scheduled_time(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(Some(at));
        self
    }

    #[must_use]
    pub const fn clear_scheduled_time(mut self) -> Self {
        self.scheduled_time = Some(None);
        self
    }

    #[must_use]
    pub const fn number_of_retries(mut self, count: u32) -> Self {
        self.number_of_retries = Some(count);
        self
    }

    #[must_use]
    pub const fn last_updated(mut self, at: DateTime<Utc>) -> Self {
        self.last_updated = Some(at);
        self
    }

    /// Apply this update to an in-memory message.
    ///
    /// Backends that hold whole rows in memory use this; database backends
    /// translate the same field set into an UPDATE statement instead.
    pub fn apply_to(&self, message: &mut Message) {
        if let Some(status) = self.status {
            message.status = status;
        }
        if let Some(scheduled_time) = self.scheduled_time {
            message.scheduled_time = scheduled_time;
        }
        if let Some(count) = self.number_of_retries {
            message.number_of_retries = Some(count);
        }
        if let Some(at) = self.last_updated {
            message.last_updated = at;
        }
    }
}

/// Durable storage for messages and their delivery logs.
///
/// The engine only ever issues single-row targeted updates through this
/// trait; cross-run serialization comes from the distributed lock, not from
/// storage-level locking.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message, returning its id.
    async fn insert(&self, message: Message) -> Result<MessageId>;

    /// Fetch a message by id.
    async fn get(&self, id: &MessageId) -> Result<Option<Message>>;

    /// Apply a targeted partial update to one message.
    ///
    /// Must not touch any field outside the update's set.
    async fn update_fields(&self, id: &MessageId, update: MessageUpdate) -> Result<()>;

    /// Atomically apply a targeted update and append a log entry: both or
    /// neither.
    async fn update_with_log(
        &self,
        id: &MessageId,
        update: MessageUpdate,
        log: Option<DeliveryLogEntry>,
    ) -> Result<()>;

    /// Fetch dispatch-eligible messages at `now`, bounded by `limit`.
    ///
    /// Predicate: status is queued or requeued, and `scheduled_time` is
    /// absent or at/before `now`. Ordering: priority descending
    /// (now > high > medium > low), ties broken by creation time ascending.
    async fn query_eligible(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Message>>;

    /// List messages carrying exactly the given status (`None` lists drafts).
    async fn list_by_status(&self, status: Option<MessageStatus>) -> Result<Vec<Message>>;

    /// Append one delivery log entry.
    async fn append_log(&self, entry: DeliveryLogEntry) -> Result<LogId>;

    /// All log entries for a message, oldest first.
    async fn logs_for(&self, id: &MessageId) -> Result<Vec<DeliveryLogEntry>>;

    /// Look a message up by its immutable provider-correlation token.
    async fn find_by_correlation_token(
        &self,
        token: &CorrelationToken,
    ) -> Result<Option<Message>>;

    /// Find the most recent log entry whose free-text payload contains
    /// `needle`.
    ///
    /// Engagement webhook events carry only a provider-internal id that was
    /// recorded inside an earlier deliverability log payload; this is the
    /// lookup that re-associates them.
    async fn find_log_by_payload_substring(
        &self,
        needle: &str,
    ) -> Result<Option<DeliveryLogEntry>>;
}
