//! The per-message delivery state machine
//!
//! One call to [`Dispatcher::dispatch`] takes one queued message through one
//! attempt over an already-open transport connection, records exactly one
//! delivery log entry for the attempt (subject to the configured log level),
//! and applies the retry policy to compute the message's next status. The
//! status transition always happens; only the persistence of the log entry
//! is gated by [`LogLevel`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use postbox_common::{Content, DeliveryLogEntry, LogStatus, Message, MessageStatus};
use postbox_store::{MessageStore, MessageUpdate};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    error::{DeliveryError, DispatchError},
    retry::{RetryDecision, RetryPolicy},
    template::{RenderedContent, TemplateEngine},
    transport::{RenderedMessage, TransportConnection},
};

/// How much attempt logging to persist.
///
/// Purely a persistence gate: the status machine runs identically at every
/// level.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Persist no attempt logs.
    Off,
    /// Persist logs for failed attempts only.
    FailuresOnly,
    /// Persist logs for every attempt.
    #[default]
    All,
}

/// Result of dispatching one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    Requeued,
    Failed,
    /// The message was past its expiry: no attempt, no log, no change.
    Skipped,
}

/// Takes one message, attempts transport send, classifies the outcome, and
/// updates status and log through the store.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn MessageStore>,
    templates: Arc<dyn TemplateEngine>,
    retry: RetryPolicy,
    log_level: LogLevel,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        templates: Arc<dyn TemplateEngine>,
        retry: RetryPolicy,
        log_level: LogLevel,
    ) -> Self {
        Self {
            store,
            templates,
            retry,
            log_level,
        }
    }

    /// The retry policy this dispatcher applies.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Attempt delivery of one message over the given open connection.
    ///
    /// # Errors
    ///
    /// Only storage failures surface here. Transport and rendering failures
    /// are absorbed into the retry state machine.
    pub async fn dispatch(
        &self,
        message: &Message,
        connection: &mut dyn TransportConnection,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        if message.is_expired(now) {
            // Expired mail is deliberately left untouched: no attempt, no
            // log, no terminal transition. Clearing it is a retention
            // concern handled outside the engine.
            debug!(id = %message.id, "skipping expired message");
            return Ok(DispatchOutcome::Skipped);
        }

        let payload = match self.render(message) {
            Ok(payload) => payload,
            Err(error) => return self.record_failure(message, &error, now).await,
        };

        match connection.send(&payload).await {
            Ok(()) => self.record_success(message, now).await,
            Err(error) => {
                self.record_failure(message, &DeliveryError::from(error), now)
                    .await
            }
        }
    }

    /// Record a successful attempt: terminal `sent`.
    async fn record_success(
        &self,
        message: &Message,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let log = (self.log_level >= LogLevel::All).then(|| {
            DeliveryLogEntry::new(message.id, now, LogStatus::Sent, "sent")
        });

        self.store
            .update_with_log(
                &message.id,
                MessageUpdate::new()
                    .status(MessageStatus::Sent)
                    .last_updated(now),
                log,
            )
            .await?;

        info!(id = %message.id, "message sent");
        Ok(DispatchOutcome::Sent)
    }

    /// Record a failed attempt and apply the retry policy.
    ///
    /// Also used by the runner when opening the transport connection itself
    /// fails; a connection failure counts as one failed attempt for each
    /// message that would have used it.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn record_failure(
        &self,
        message: &Message,
        error: &DeliveryError,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let attempt = message.number_of_retries.unwrap_or(0) + 1;

        let log = (self.log_level >= LogLevel::FailuresOnly).then(|| {
            DeliveryLogEntry::new(message.id, now, LogStatus::Failed, error.to_string())
                .with_exception_kind(error.kind_name())
        });

        match self.retry.decide(attempt, now) {
            RetryDecision::Requeue {
                number_of_retries,
                scheduled_time,
            } => {
                self.store
                    .update_with_log(
                        &message.id,
                        MessageUpdate::new()
                            .status(MessageStatus::Requeued)
                            .number_of_retries(number_of_retries)
                            .scheduled_time(scheduled_time)
                            .last_updated(now),
                        log,
                    )
                    .await?;

                warn!(
                    id = %message.id,
                    attempt,
                    retry_at = %scheduled_time,
                    error = %error,
                    "delivery failed, requeued"
                );
                Ok(DispatchOutcome::Requeued)
            }
            RetryDecision::Fail => {
                // Terminal: the retry counter and scheduled time keep the
                // values from the last requeue.
                self.store
                    .update_with_log(
                        &message.id,
                        MessageUpdate::new()
                            .status(MessageStatus::Failed)
                            .last_updated(now),
                        log,
                    )
                    .await?;

                warn!(id = %message.id, attempt, error = %error, "delivery failed terminally");
                Ok(DispatchOutcome::Failed)
            }
        }
    }

    /// Produce the final transport payload for a message.
    fn render(&self, message: &Message) -> Result<RenderedMessage, DeliveryError> {
        let content = match &message.content {
            Content::Literal {
                subject,
                body,
                html_body,
            } => RenderedContent {
                subject: subject.clone(),
                body: body.clone(),
                html_body: html_body.clone(),
            },
            Content::Template { template, context } => {
                self.templates.render(template, context)?
            }
        };

        Ok(RenderedMessage::assemble(message, content))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Dispatcher")
            .field("retry", &self.retry)
            .field("log_level", &self.log_level)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use postbox_common::Priority;
    use postbox_store::MemoryMessageStore;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        template::SimpleTemplateEngine,
        transport::{LoopbackTransport, Transport, TransportError},
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single().unwrap()
    }

    struct FailingConnection;

    #[async_trait]
    impl TransportConnection for FailingConnection {
        async fn send(&mut self, _: &RenderedMessage) -> Result<(), TransportError> {
            Err(TransportError::Send("connection reset".into()))
        }

        async fn close(&mut self) {}
    }

    fn dispatcher(store: &MemoryMessageStore, log_level: LogLevel) -> Dispatcher {
        Dispatcher::new(
            Arc::new(store.clone()),
            Arc::new(SimpleTemplateEngine::new()),
            RetryPolicy::default(),
            log_level,
        )
    }

    async fn queued_message(store: &MemoryMessageStore) -> Message {
        let mut message = Message::new_at("sender@example.com", t0())
            .with_to(["rcpt@example.com"])
            .with_subject("hi")
            .with_body("there")
            .with_priority(Priority::High);
        message.status = Some(MessageStatus::Queued);
        store.insert(message.clone()).await.unwrap();
        message
    }

    #[tokio::test]
    async fn success_marks_sent_and_logs() {
        let store = MemoryMessageStore::new();
        let dispatcher = dispatcher(&store, LogLevel::All);
        let message = queued_message(&store).await;

        let transport = LoopbackTransport::new();
        let mut connection = transport.open().await.unwrap();

        let outcome = dispatcher
            .dispatch(&message, connection.as_mut(), t0())
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Sent);
        assert_eq!(transport.sent_count(), 1);
        let stored = store.get(&message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Some(MessageStatus::Sent));
        assert_eq!(store.logs_for(&message.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failure_requeues_with_linear_backoff() {
        let store = MemoryMessageStore::new();
        let dispatcher = dispatcher(&store, LogLevel::All);
        let message = queued_message(&store).await;

        let outcome = dispatcher
            .dispatch(&message, &mut FailingConnection, t0())
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Requeued);
        let stored = store.get(&message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Some(MessageStatus::Requeued));
        assert_eq!(stored.number_of_retries, Some(1));
        assert_eq!(stored.scheduled_time, Some(t0() + Duration::minutes(15)));

        let logs = store.logs_for(&message.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Failed);
        assert_eq!(logs[0].exception_kind.as_deref(), Some("SendFailed"));
        assert!(logs[0].message.contains("connection reset"));
    }

    #[tokio::test]
    async fn exhausted_retries_fail_terminally_without_advancing_schedule() {
        let store = MemoryMessageStore::new();
        let dispatcher = dispatcher(&store, LogLevel::All);
        let mut message = queued_message(&store).await;

        // Two failures already recorded.
        message.number_of_retries = Some(2);
        let retry_schedule = t0() + Duration::minutes(45);
        message.scheduled_time = Some(retry_schedule);
        store
            .update_fields(
                &message.id,
                MessageUpdate::new()
                    .number_of_retries(2)
                    .scheduled_time(retry_schedule),
            )
            .await
            .unwrap();

        let later = t0() + Duration::hours(1);
        let outcome = dispatcher
            .dispatch(&message, &mut FailingConnection, later)
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Failed);
        let stored = store.get(&message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Some(MessageStatus::Failed));
        // Untouched by the terminal transition.
        assert_eq!(stored.number_of_retries, Some(2));
        assert_eq!(stored.scheduled_time, Some(retry_schedule));
    }

    #[tokio::test]
    async fn expired_message_is_skipped_entirely() {
        let store = MemoryMessageStore::new();
        let dispatcher = dispatcher(&store, LogLevel::All);

        let mut message = Message::new_at("sender@example.com", t0())
            .with_to(["rcpt@example.com"])
            .with_expires_at(t0() + Duration::minutes(5));
        message.status = Some(MessageStatus::Queued);
        store.insert(message.clone()).await.unwrap();

        let outcome = dispatcher
            .dispatch(&message, &mut FailingConnection, t0() + Duration::minutes(10))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Skipped);
        let stored = store.get(&message.id).await.unwrap().unwrap();
        // Still queued, no attempt recorded: clearing is a manual concern.
        assert_eq!(stored.status, Some(MessageStatus::Queued));
        assert_eq!(stored.number_of_retries, None);
        assert!(store.logs_for(&message.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn log_level_gates_persistence_not_transitions() {
        let store = MemoryMessageStore::new();
        let dispatcher = dispatcher(&store, LogLevel::Off);
        let message = queued_message(&store).await;

        let outcome = dispatcher
            .dispatch(&message, &mut FailingConnection, t0())
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Requeued);
        assert!(store.logs_for(&message.id).await.unwrap().is_empty());
        let stored = store.get(&message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Some(MessageStatus::Requeued));
    }

    #[tokio::test]
    async fn failures_only_level_skips_success_logs() {
        let store = MemoryMessageStore::new();
        let dispatcher = dispatcher(&store, LogLevel::FailuresOnly);
        let message = queued_message(&store).await;

        let transport = LoopbackTransport::new();
        let mut connection = transport.open().await.unwrap();
        dispatcher
            .dispatch(&message, connection.as_mut(), t0())
            .await
            .unwrap();

        assert!(store.logs_for(&message.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_template_counts_as_failed_attempt() {
        let store = MemoryMessageStore::new();
        let dispatcher = dispatcher(&store, LogLevel::All);

        let mut message = Message::new_at("sender@example.com", t0())
            .with_to(["rcpt@example.com"])
            .with_template("missing", std::collections::BTreeMap::new());
        message.status = Some(MessageStatus::Queued);
        store.insert(message.clone()).await.unwrap();

        let transport = LoopbackTransport::new();
        let mut connection = transport.open().await.unwrap();
        let outcome = dispatcher
            .dispatch(&message, connection.as_mut(), t0())
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Requeued);
        assert_eq!(transport.sent_count(), 0);
        let logs = store.logs_for(&message.id).await.unwrap();
        assert_eq!(logs[0].exception_kind.as_deref(), Some("TemplateNotFound"));
    }
}
