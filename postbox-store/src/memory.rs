//! In-memory message store
//!
//! Stores messages in a `HashMap` behind an `RwLock` and logs in an
//! append-only vector. Primarily intended for testing, but usable for
//! transient single-process deployments where durability across restarts is
//! not required.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use postbox_common::{
    CorrelationToken, DeliveryLogEntry, LogId, Message, MessageId, MessageStatus,
};

use crate::{
    Result, StoreError,
    store::{MessageStore, MessageUpdate},
};

#[derive(Debug, Default)]
struct Inner {
    messages: HashMap<MessageId, Message>,
    logs: Vec<DeliveryLogEntry>,
}

/// In-memory [`MessageStore`] implementation.
///
/// Cloning is cheap; clones share the same underlying storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryMessageStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of log entries currently stored.
    #[must_use]
    pub fn log_count(&self) -> usize {
        self.inner.read().logs.len()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, message: Message) -> Result<MessageId> {
        let id = message.id;
        self.inner.write().messages.insert(id, message);
        Ok(id)
    }

    async fn get(&self, id: &MessageId) -> Result<Option<Message>> {
        Ok(self.inner.read().messages.get(id).cloned())
    }

    async fn update_fields(&self, id: &MessageId, update: MessageUpdate) -> Result<()> {
        let mut inner = self.inner.write();
        let message = inner
            .messages
            .get_mut(id)
            .ok_or(StoreError::MessageNotFound(*id))?;
        update.apply_to(message);
        Ok(())
    }

    async fn update_with_log(
        &self,
        id: &MessageId,
        update: MessageUpdate,
        log: Option<DeliveryLogEntry>,
    ) -> Result<()> {
        // One write-lock span makes the pair atomic for this backend.
        let mut inner = self.inner.write();
        let message = inner
            .messages
            .get_mut(id)
            .ok_or(StoreError::MessageNotFound(*id))?;
        update.apply_to(message);
        if let Some(entry) = log {
            inner.logs.push(entry);
        }
        Ok(())
    }

    async fn query_eligible(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Message>> {
        let inner = self.inner.read();
        let mut eligible: Vec<Message> = inner
            .messages
            .values()
            .filter(|message| message.is_eligible(now))
            .cloned()
            .collect();

        eligible.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created.cmp(&b.created))
        });
        eligible.truncate(limit);

        Ok(eligible)
    }

    async fn list_by_status(&self, status: Option<MessageStatus>) -> Result<Vec<Message>> {
        let inner = self.inner.read();
        let mut matching: Vec<Message> = inner
            .messages
            .values()
            .filter(|message| message.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|message| message.created);
        Ok(matching)
    }

    async fn append_log(&self, entry: DeliveryLogEntry) -> Result<LogId> {
        let id = entry.id;
        self.inner.write().logs.push(entry);
        Ok(id)
    }

    async fn logs_for(&self, id: &MessageId) -> Result<Vec<DeliveryLogEntry>> {
        Ok(self
            .inner
            .read()
            .logs
            .iter()
            .filter(|entry| entry.message_id == *id)
            .cloned()
            .collect())
    }

    async fn find_by_correlation_token(
        &self,
        token: &CorrelationToken,
    ) -> Result<Option<Message>> {
        Ok(self
            .inner
            .read()
            .messages
            .values()
            .find(|message| message.correlation_token == *token)
            .cloned())
    }

    async fn find_log_by_payload_substring(
        &self,
        needle: &str,
    ) -> Result<Option<DeliveryLogEntry>> {
        Ok(self
            .inner
            .read()
            .logs
            .iter()
            .rev()
            .find(|entry| entry.message.contains(needle))
            .cloned())
    }
}
