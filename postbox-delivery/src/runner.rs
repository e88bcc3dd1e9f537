//! Lock-protected orchestration of a full dispatch run
//!
//! One run: take the dispatch lock, select a batch, partition it across a
//! bounded pool of workers (one transport connection per worker partition,
//! opened once and reused), join with a global wall-clock timeout, aggregate
//! counts, release the lock on every exit path.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use postbox_common::Message;
use postbox_lock::{DistributedLock, LockError};
use postbox_store::MessageStore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::{
    dispatcher::{DispatchOutcome, Dispatcher},
    error::{DeliveryError, DispatchError, SystemError, TemporaryError},
    selector::BatchSelector,
    transport::{TransportConnection, TransportRegistry},
};

/// Well-known lock name serializing dispatch runs across hosts.
pub const DISPATCH_LOCK_NAME: &str = "postbox_dispatch";

/// Aggregated outcome counts for one dispatch run.
///
/// Skipped (expired) messages are deliberately absent: they are neither
/// attempts nor outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub sent: usize,
    pub failed: usize,
    pub requeued: usize,
}

impl RunCounts {
    /// Total number of attempts that reached an outcome.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.sent + self.failed + self.requeued
    }

    fn absorb(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Sent => self.sent += 1,
            DispatchOutcome::Failed => self.failed += 1,
            DispatchOutcome::Requeued => self.requeued += 1,
            DispatchOutcome::Skipped => {}
        }
    }

    fn merge(&mut self, other: Self) {
        self.sent += other.sent;
        self.failed += other.failed;
        self.requeued += other.requeued;
    }
}

/// Orchestrates lock-protected, fanned-out dispatch runs.
#[derive(Clone)]
pub struct DispatchRunner {
    selector: BatchSelector,
    dispatcher: Arc<Dispatcher>,
    transports: Arc<TransportRegistry>,
    lock: DistributedLock,
}

impl DispatchRunner {
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        dispatcher: Arc<Dispatcher>,
        transports: Arc<TransportRegistry>,
        lock: DistributedLock,
    ) -> Self {
        Self {
            selector: BatchSelector::new(store),
            dispatcher,
            transports,
            lock,
        }
    }

    /// Run one dispatch cycle at the current instant.
    ///
    /// # Errors
    ///
    /// See [`run_at`](Self::run_at).
    pub async fn run(
        &self,
        processes: usize,
        batch_size: usize,
    ) -> Result<RunCounts, DispatchError> {
        self.run_at(Utc::now(), processes, batch_size).await
    }

    /// Run one dispatch cycle with an explicit clock.
    ///
    /// If another run holds the dispatch lock this logs and returns zeroed
    /// counts; contention is expected, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::BatchTimeout`] if the run overran the batch
    /// delivery timeout (the lock is still released; in-flight sends are
    /// abandoned with unknown outcomes), or a storage error from batch
    /// selection.
    pub async fn run_at(
        &self,
        now: DateTime<Utc>,
        processes: usize,
        batch_size: usize,
    ) -> Result<RunCounts, DispatchError> {
        let mut guard = match self.lock.try_acquire(DISPATCH_LOCK_NAME) {
            Ok(guard) => guard,
            Err(LockError::Locked(_)) => {
                info!("dispatch lock held elsewhere, skipping this run");
                return Ok(RunCounts::default());
            }
            Err(error) => return Err(error.into()),
        };

        // Guard drop releases the lock on the selection-error path.
        let batch = self.selector.select(now, batch_size).await?;
        if batch.is_empty() {
            guard.release();
            return Ok(RunCounts::default());
        }

        let mut join_set: JoinSet<RunCounts> = JoinSet::new();
        for slice in partition(batch, processes) {
            let dispatcher = Arc::clone(&self.dispatcher);
            let transports = Arc::clone(&self.transports);
            join_set.spawn(async move {
                process_slice(&dispatcher, &transports, slice, now).await
            });
        }

        let drain = async move {
            let mut total = RunCounts::default();
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(counts) => total.merge(counts),
                    Err(join_error) => error!(error = %join_error, "dispatch worker aborted"),
                }
            }
            total
        };

        let timeout = self.dispatcher.retry_policy().batch_timeout();
        let outcome = tokio::time::timeout(timeout, drain).await;
        guard.release();

        match outcome {
            Ok(total) => {
                info!(
                    sent = total.sent,
                    failed = total.failed,
                    requeued = total.requeued,
                    "dispatch run complete"
                );
                Ok(total)
            }
            Err(_) => {
                // Dropping the drain future dropped the JoinSet, aborting
                // every worker; abandoned sends have unknown outcomes and a
                // later run may deliver them again.
                error!(timeout = ?timeout, "dispatch run aborted on batch timeout");
                Err(DispatchError::BatchTimeout)
            }
        }
    }
}

impl std::fmt::Debug for DispatchRunner {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("DispatchRunner").finish_non_exhaustive()
    }
}

/// Split a batch into at most `processes` roughly-equal contiguous slices.
fn partition(batch: Vec<Message>, processes: usize) -> Vec<Vec<Message>> {
    let len = batch.len();
    if len == 0 {
        return Vec::new();
    }
    let slices = processes.max(1).min(len);
    let base = len / slices;
    let remainder = len % slices;

    let mut parts = Vec::with_capacity(slices);
    let mut rest = batch;
    for index in 0..slices {
        let take = base + usize::from(index < remainder);
        let tail = rest.split_off(take);
        parts.push(rest);
        rest = tail;
    }
    parts
}

/// Serially drain one partition, opening each backend's connection once.
async fn process_slice(
    dispatcher: &Dispatcher,
    transports: &TransportRegistry,
    slice: Vec<Message>,
    now: DateTime<Utc>,
) -> RunCounts {
    let mut counts = RunCounts::default();
    // One connection per backend alias for the whole slice. A failed open is
    // remembered so the slice does not hammer a dead backend per message.
    let mut connections: HashMap<String, Option<Box<dyn TransportConnection>>> = HashMap::new();

    for message in &slice {
        let alias = message.backend_alias.clone();

        if !connections.contains_key(&alias) {
            let opened = match transports.resolve(&alias) {
                Some(transport) => match transport.open().await {
                    Ok(connection) => Some(connection),
                    Err(open_error) => {
                        error!(alias = %alias, error = %open_error, "failed to open transport connection");
                        None
                    }
                },
                None => {
                    error!(alias = %alias, "no transport registered for backend alias");
                    None
                }
            };
            connections.insert(alias.clone(), opened);
        }

        let result = match connections.get_mut(&alias) {
            Some(Some(connection)) => {
                dispatcher.dispatch(message, connection.as_mut(), now).await
            }
            // Connection-open failure counts as one failed attempt per
            // message, identical to a send failure.
            _ => {
                let failure = if transports.resolve(&alias).is_some() {
                    DeliveryError::Temporary(TemporaryError::ConnectionFailed(format!(
                        "could not open connection for backend {alias:?}"
                    )))
                } else {
                    DeliveryError::System(SystemError::UnknownBackend(alias.clone()))
                };
                dispatcher.record_failure(message, &failure, now).await
            }
        };

        match result {
            Ok(outcome) => counts.absorb(outcome),
            // A storage failure on one message never aborts the batch.
            Err(store_error) => {
                error!(id = %message.id, error = %store_error, "failed to record dispatch outcome");
            }
        }
    }

    for connection in connections.values_mut().flatten() {
        connection.close().await;
    }

    counts
}
