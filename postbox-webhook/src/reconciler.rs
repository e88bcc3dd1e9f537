//! Timestamp-guarded reconciliation of provider events
//!
//! Providers redeliver webhooks and batch events in reverse chronological
//! order, so the same payload may arrive twice and a "delivered" may arrive
//! before the "accepted" that preceded it. The reconciler restores oldest-first
//! order within a payload and refuses to move a message's status backwards in
//! time; every event still lands in the log.

use std::sync::Arc;

use postbox_common::{DeliveryLogEntry, Message, MessageStatus};
use postbox_store::{MessageStore, MessageUpdate};
use tracing::{info, warn};

use crate::error::WebhookError;
use crate::event::Event;
use crate::provider::{ProviderEvent, ProviderVocabulary};

/// What happened to each event in one payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Events that moved a message's status.
    pub applied: usize,
    /// Events recorded in the log without a status change.
    pub logged: usize,
    /// Events dropped entirely (unknown kind, unknown message).
    pub skipped: usize,
}

/// Applies provider webhook events to the message store.
pub struct WebhookReconciler {
    store: Arc<dyn MessageStore>,
    vocabulary: Arc<dyn ProviderVocabulary>,
}

impl WebhookReconciler {
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, vocabulary: Arc<dyn ProviderVocabulary>) -> Self {
        Self { store, vocabulary }
    }

    /// Process one raw webhook body.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Malformed`] when the body cannot be parsed,
    /// [`WebhookError::AccountSuspended`] when the provider reports an
    /// account-level suspension, and [`WebhookError::Store`] on storage
    /// failure. Per-event problems are absorbed into the report instead.
    pub async fn process_payload(&self, body: &[u8]) -> Result<ReconcileReport, WebhookError> {
        let mut raw_events = self.vocabulary.parse_payload(body)?;
        // Providers batch events newest-first; apply oldest-first so the
        // timestamp guard sees them in causal order.
        raw_events.reverse();

        let mut report = ReconcileReport::default();

        for raw in &raw_events {
            let Some(event) = self.vocabulary.translate(raw) else {
                warn!(raw = %raw, "unrecognized webhook event kind, skipping");
                report.skipped += 1;
                continue;
            };

            if event.kind.is_account_level() {
                return Err(WebhookError::AccountSuspended(event.raw.to_string()));
            }

            if event.kind.is_engagement() {
                self.apply_engagement(&event, &mut report).await?;
            } else {
                self.apply_deliverability(&event, &mut report).await?;
            }
        }

        Ok(report)
    }

    /// Apply one deliverability event, matched by correlation token.
    async fn apply_deliverability(
        &self,
        event: &ProviderEvent,
        report: &mut ReconcileReport,
    ) -> Result<(), WebhookError> {
        let Some(token) = &event.token else {
            info!(kind = %event.kind, "deliverability event without a correlation token, skipping");
            report.skipped += 1;
            return Ok(());
        };

        let Some(message) = self.store.find_by_correlation_token(token).await? else {
            info!(%token, kind = %event.kind, "webhook event for unknown message, skipping");
            report.skipped += 1;
            return Ok(());
        };

        let log = self.log_entry(&message, event);

        if self.guard_allows(&message, event) {
            let status = event
                .kind
                .message_status()
                .unwrap_or(MessageStatus::Queued);
            let update = MessageUpdate::new()
                .status(status)
                .last_updated(event.occurred_at);
            self.store
                .update_with_log(&message.id, update, Some(log))
                .await?;
            report.applied += 1;
        } else {
            // Stale or out-of-order: the audit trail still gets the event.
            self.store.append_log(log).await?;
            report.logged += 1;
        }

        Ok(())
    }

    /// Apply one engagement event, matched through an earlier deliverability
    /// log payload carrying the provider's own message id.
    async fn apply_engagement(
        &self,
        event: &ProviderEvent,
        report: &mut ReconcileReport,
    ) -> Result<(), WebhookError> {
        let Some(provider_id) = &event.provider_id else {
            info!(kind = %event.kind, "engagement event without a provider id, skipping");
            report.skipped += 1;
            return Ok(());
        };

        let Some(prior) = self
            .store
            .find_log_by_payload_substring(provider_id)
            .await?
        else {
            info!(
                provider_id,
                kind = %event.kind,
                "engagement event matches no prior delivery log, skipping"
            );
            report.skipped += 1;
            return Ok(());
        };

        let Some(message) = self.store.get(&prior.message_id).await? else {
            report.skipped += 1;
            return Ok(());
        };

        let log = self.log_entry(&message, event);

        // Engagement implies the message was delivered; promote a stale
        // status but never touch one that is already sent.
        if message.status == Some(MessageStatus::Sent) {
            self.store.append_log(log).await?;
            report.logged += 1;
        } else {
            let update = MessageUpdate::new()
                .status(MessageStatus::Sent)
                .last_updated(event.occurred_at);
            self.store
                .update_with_log(&message.id, update, Some(log))
                .await?;
            report.applied += 1;
        }

        Ok(())
    }

    /// Whether a deliverability event may move this message's status.
    ///
    /// An event only applies when it is strictly newer than the message's
    /// last update, and an acceptance never demotes a message that already
    /// reached sent.
    fn guard_allows(&self, message: &Message, event: &ProviderEvent) -> bool {
        event.occurred_at > message.last_updated
            && !(message.status == Some(MessageStatus::Sent) && event.kind == Event::Accepted)
    }

    fn log_entry(&self, message: &Message, event: &ProviderEvent) -> DeliveryLogEntry {
        DeliveryLogEntry::new(
            message.id,
            event.occurred_at,
            event.kind.log_status(),
            event.raw.to_string(),
        )
        .with_exception_kind(event.kind.to_string())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use postbox_common::Priority;
    use postbox_store::MemoryMessageStore;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    use super::*;
    use crate::provider::MandrillVocabulary;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single().unwrap()
    }

    fn reconciler(store: &MemoryMessageStore) -> WebhookReconciler {
        WebhookReconciler::new(
            Arc::new(store.clone()),
            Arc::new(MandrillVocabulary::new()),
        )
    }

    async fn queued_message(store: &MemoryMessageStore) -> Message {
        let mut message = Message::new_at("sender@example.com", t0())
            .with_to(["rcpt@example.com"])
            .with_priority(Priority::Medium);
        message.status = Some(MessageStatus::Queued);
        store.insert(message.clone()).await.expect("insert");
        message
    }

    fn raw_event(event: &str, ts: DateTime<Utc>, token: &str) -> Value {
        json!({
            "event": event,
            "ts": ts.timestamp(),
            "_id": "prov-1",
            "msg": {"metadata": {"message_id": token}},
        })
    }

    fn body(events: &[Value]) -> Vec<u8> {
        serde_json::to_vec(&Value::Array(events.to_vec())).expect("serialize")
    }

    #[tokio::test]
    async fn delivered_event_marks_sent() {
        let store = MemoryMessageStore::new();
        let message = queued_message(&store).await;
        let token = message.correlation_token.as_str();

        let at = t0() + chrono::Duration::minutes(1);
        let report = reconciler(&store)
            .process_payload(&body(&[raw_event("delivered", at, token)]))
            .await
            .expect("process");

        assert_eq!(report.applied, 1);
        let stored = store.get(&message.id).await.expect("get").expect("exists");
        assert_eq!(stored.status, Some(MessageStatus::Sent));
        assert_eq!(stored.last_updated, at);
    }

    #[tokio::test]
    async fn reverse_chronological_batch_applies_oldest_first() {
        let store = MemoryMessageStore::new();
        let message = queued_message(&store).await;
        let token = message.correlation_token.as_str();

        // Provider order: newest first (delivered, then accepted).
        let accepted_at = t0() + chrono::Duration::minutes(1);
        let delivered_at = t0() + chrono::Duration::minutes(2);
        let report = reconciler(&store)
            .process_payload(&body(&[
                raw_event("delivered", delivered_at, token),
                raw_event("send", accepted_at, token),
            ]))
            .await
            .expect("process");

        assert_eq!(report.applied, 2);
        let stored = store.get(&message.id).await.expect("get").expect("exists");
        assert_eq!(stored.status, Some(MessageStatus::Sent));
        assert_eq!(stored.last_updated, delivered_at);
    }

    #[tokio::test]
    async fn late_acceptance_never_demotes_a_sent_message() {
        let store = MemoryMessageStore::new();
        let message = queued_message(&store).await;
        let token = message.correlation_token.as_str();
        let engine = reconciler(&store);

        let delivered_at = t0() + chrono::Duration::minutes(1);
        engine
            .process_payload(&body(&[raw_event("delivered", delivered_at, token)]))
            .await
            .expect("delivered");

        // An acceptance with a later timestamp would pass the freshness
        // check alone; the sent guard must still hold it back.
        let accepted_at = t0() + chrono::Duration::minutes(5);
        let report = engine
            .process_payload(&body(&[raw_event("send", accepted_at, token)]))
            .await
            .expect("accepted");

        assert_eq!(report.applied, 0);
        assert_eq!(report.logged, 1);
        let stored = store.get(&message.id).await.expect("get").expect("exists");
        assert_eq!(stored.status, Some(MessageStatus::Sent));
        assert_eq!(stored.last_updated, delivered_at);
        // Both events remain in the audit trail.
        assert_eq!(store.logs_for(&message.id).await.expect("logs").len(), 2);
    }

    #[tokio::test]
    async fn stale_event_is_logged_but_not_applied() {
        let store = MemoryMessageStore::new();
        let message = queued_message(&store).await;
        let token = message.correlation_token.as_str();

        // Occurred before the message's last update: out of date.
        let at = t0() - chrono::Duration::minutes(1);
        let report = reconciler(&store)
            .process_payload(&body(&[raw_event("delivered", at, token)]))
            .await
            .expect("process");

        assert_eq!(report.applied, 0);
        assert_eq!(report.logged, 1);
        let stored = store.get(&message.id).await.expect("get").expect("exists");
        assert_eq!(stored.status, Some(MessageStatus::Queued));
    }

    #[tokio::test]
    async fn unknown_token_is_skipped_without_error() {
        let store = MemoryMessageStore::new();
        let message = queued_message(&store).await;

        let at = t0() + chrono::Duration::minutes(1);
        let report = reconciler(&store)
            .process_payload(&body(&[raw_event("delivered", at, "<stranger@elsewhere>")]))
            .await
            .expect("process");

        assert_eq!(report.skipped, 1);
        let stored = store.get(&message.id).await.expect("get").expect("exists");
        assert_eq!(stored.status, Some(MessageStatus::Queued));
        assert!(store.logs_for(&message.id).await.expect("logs").is_empty());
    }

    #[tokio::test]
    async fn hard_bounce_marks_failed() {
        let store = MemoryMessageStore::new();
        let message = queued_message(&store).await;
        let token = message.correlation_token.as_str();

        let at = t0() + chrono::Duration::minutes(1);
        reconciler(&store)
            .process_payload(&body(&[raw_event("hard_bounce", at, token)]))
            .await
            .expect("process");

        let stored = store.get(&message.id).await.expect("get").expect("exists");
        assert_eq!(stored.status, Some(MessageStatus::Failed));
        let logs = store.logs_for(&message.id).await.expect("logs");
        assert_eq!(logs[0].status, postbox_common::LogStatus::Failed);
    }

    #[tokio::test]
    async fn engagement_promotes_through_prior_log_payload() {
        let store = MemoryMessageStore::new();
        let message = queued_message(&store).await;
        let token = message.correlation_token.as_str();
        let engine = reconciler(&store);

        // A deliverability event first, so a log payload carries "prov-1".
        let delivered_at = t0() + chrono::Duration::minutes(1);
        engine
            .process_payload(&body(&[raw_event("delivered", delivered_at, token)]))
            .await
            .expect("delivered");

        // Open events carry only the provider id, no correlation token.
        let open_at = t0() + chrono::Duration::minutes(10);
        let open = json!({"event": "open", "ts": open_at.timestamp(), "_id": "prov-1"});
        let report = engine
            .process_payload(&body(&[open]))
            .await
            .expect("open");

        // Already sent: the open is logged without another status write.
        assert_eq!(report.logged, 1);
        let stored = store.get(&message.id).await.expect("get").expect("exists");
        assert_eq!(stored.status, Some(MessageStatus::Sent));
        assert_eq!(stored.last_updated, delivered_at);
        assert_eq!(store.logs_for(&message.id).await.expect("logs").len(), 2);
    }

    #[tokio::test]
    async fn engagement_backfills_sent_on_a_stale_message() {
        let store = MemoryMessageStore::new();
        let message = queued_message(&store).await;
        let token = message.correlation_token.as_str();
        let engine = reconciler(&store);

        // The acceptance was recorded, but the delivered event was lost.
        let accepted_at = t0() + chrono::Duration::minutes(1);
        engine
            .process_payload(&body(&[raw_event("send", accepted_at, token)]))
            .await
            .expect("accepted");

        let click_at = t0() + chrono::Duration::minutes(20);
        let click = json!({"event": "click", "ts": click_at.timestamp(), "_id": "prov-1"});
        let report = engine.process_payload(&body(&[click])).await.expect("click");

        assert_eq!(report.applied, 1);
        let stored = store.get(&message.id).await.expect("get").expect("exists");
        assert_eq!(stored.status, Some(MessageStatus::Sent));
        assert_eq!(stored.last_updated, click_at);
    }

    #[tokio::test]
    async fn engagement_with_no_matching_log_is_skipped() {
        let store = MemoryMessageStore::new();
        queued_message(&store).await;

        let open = json!({"event": "open", "ts": t0().timestamp(), "_id": "prov-unseen"});
        let report = reconciler(&store)
            .process_payload(&body(&[open]))
            .await
            .expect("process");

        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn account_suspension_aborts_loudly() {
        let store = MemoryMessageStore::new();
        let message = queued_message(&store).await;
        let token = message.correlation_token.as_str();

        let result = reconciler(&store)
            .process_payload(&body(&[raw_event("blacklist", t0(), token)]))
            .await;

        assert!(matches!(result, Err(WebhookError::AccountSuspended(_))));
    }

    #[tokio::test]
    async fn unknown_kind_is_skipped() {
        let store = MemoryMessageStore::new();
        let message = queued_message(&store).await;
        let token = message.correlation_token.as_str();

        let at = t0() + chrono::Duration::minutes(1);
        let report = reconciler(&store)
            .process_payload(&body(&[
                raw_event("whitelist", at, token),
                raw_event("delivered", at, token),
            ]))
            .await
            .expect("process");

        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped, 1);
    }
}
