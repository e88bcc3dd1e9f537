//! The enqueue and administration API
//!
//! [`Mailer`] is the front door for producers: validate and enqueue mail,
//! save drafts, and perform the administrative operations (manual retry of
//! terminal failures, lock inspection) that the dispatch loop never does on
//! its own.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use postbox_common::{Message, MessageId, MessageStatus, ValidationError};
use postbox_delivery::{
    DeliveryError, DispatchError, DispatchOutcome, Dispatcher, SystemError, TransportRegistry,
};
use postbox_lock::DistributedLock;
use postbox_store::{LockLease, MessageStore, MessageUpdate, StoreError};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum MailerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Producer-facing API over the message store and dispatcher.
pub struct Mailer {
    store: Arc<dyn MessageStore>,
    dispatcher: Arc<Dispatcher>,
    transports: Arc<TransportRegistry>,
    lock: DistributedLock,
}

impl Mailer {
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        dispatcher: Arc<Dispatcher>,
        transports: Arc<TransportRegistry>,
        lock: DistributedLock,
    ) -> Self {
        Self {
            store,
            dispatcher,
            transports,
            lock,
        }
    }

    /// Validate and enqueue a message for delivery.
    ///
    /// The message is stored with status queued. A message with priority
    /// `now` additionally gets one immediate dispatch attempt, outside the
    /// periodic loop; failure there feeds the normal retry machinery rather
    /// than surfacing to the producer.
    ///
    /// # Errors
    ///
    /// Validation problems are synchronous creation-time errors; storage
    /// failures propagate.
    pub async fn send(&self, message: Message) -> Result<MessageId, MailerError> {
        self.send_at(message, Utc::now()).await
    }

    /// [`send`](Self::send) with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_at(
        &self,
        mut message: Message,
        now: DateTime<Utc>,
    ) -> Result<MessageId, MailerError> {
        message.validate()?;
        message.status = Some(MessageStatus::Queued);

        let immediate = message.priority == postbox_common::Priority::Now;
        let id = self.store.insert(message.clone()).await?;

        if immediate {
            self.dispatch_one(&message, now).await?;
        }

        Ok(id)
    }

    /// Store a message as a draft: no status, never selected for dispatch.
    ///
    /// # Errors
    ///
    /// Validation problems and storage failures propagate.
    pub async fn save_draft(&self, mut message: Message) -> Result<MessageId, MailerError> {
        message.validate()?;
        message.status = None;

        Ok(self.store.insert(message).await?)
    }

    /// Requeue every terminally failed message for another delivery attempt.
    ///
    /// This is the only sanctioned exit from a terminal status, and it is
    /// always an explicit administrative action. The retry counter restarts
    /// so each message gets a full retry budget again.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn requeue_failed(&self, now: DateTime<Utc>) -> Result<usize, MailerError> {
        let failed = self.store.list_by_status(Some(MessageStatus::Failed)).await?;
        let count = failed.len();

        for message in failed {
            self.store
                .update_fields(
                    &message.id,
                    MessageUpdate::new()
                        .status(MessageStatus::Requeued)
                        .number_of_retries(0)
                        .clear_scheduled_time()
                        .last_updated(now),
                )
                .await?;
        }

        if count > 0 {
            info!(count, "requeued failed messages");
        }

        Ok(count)
    }

    /// All currently stored lock leases, live or expired.
    #[must_use]
    pub fn leases(&self) -> Vec<LockLease> {
        self.lock.leases()
    }

    /// Forcibly remove a lock lease regardless of owner.
    ///
    /// Operator escape hatch for leases orphaned by a crashed process.
    pub fn force_clear_lock(&self, name: &str) -> bool {
        self.lock.force_clear(name)
    }

    /// One immediate dispatch attempt for a now-priority message.
    async fn dispatch_one(
        &self,
        message: &Message,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(transport) = self.transports.resolve(&message.backend_alias) else {
            let error =
                DeliveryError::from(SystemError::UnknownBackend(message.backend_alias.clone()));
            return self.dispatcher.record_failure(message, &error, now).await;
        };

        match transport.open().await {
            Ok(mut connection) => {
                let outcome = self
                    .dispatcher
                    .dispatch(message, connection.as_mut(), now)
                    .await;
                connection.close().await;
                outcome
            }
            Err(error) => {
                self.dispatcher
                    .record_failure(message, &DeliveryError::from(error), now)
                    .await
            }
        }
    }
}
