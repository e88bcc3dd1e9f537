//! The periodic dispatch service
//!
//! Runs dispatch cycles on a fixed interval until a shutdown signal arrives,
//! then releases every lock lease this process still holds so a restart (or
//! a peer) can take over without waiting out lease expiry.

use std::sync::Arc;

use postbox_common::Signal;
use postbox_delivery::{DispatchError, DispatchRunner, RunCounts};
use postbox_lock::DistributedLock;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::config::DispatchConfig;

/// Periodic dispatch loop with graceful shutdown.
pub struct Service {
    runner: Arc<DispatchRunner>,
    lock: DistributedLock,
    dispatch: DispatchConfig,
}

impl Service {
    #[must_use]
    pub fn new(
        runner: Arc<DispatchRunner>,
        lock: DistributedLock,
        dispatch: DispatchConfig,
    ) -> Self {
        Self {
            runner,
            lock,
            dispatch,
        }
    }

    /// Run one dispatch cycle now.
    ///
    /// # Errors
    ///
    /// See [`DispatchRunner::run`].
    pub async fn run_once(&self) -> Result<RunCounts, DispatchError> {
        self.runner
            .run(self.dispatch.processes, self.dispatch.batch_size)
            .await
    }

    /// Run dispatch cycles until a shutdown signal is received.
    ///
    /// A cycle that overruns the batch timeout or hits a storage error is
    /// logged and does not stop the loop; the lock machinery already
    /// guarantees the lease was released.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) {
        info!(
            interval_secs = self.dispatch.interval_secs,
            processes = self.dispatch.processes,
            batch_size = self.dispatch.batch_size,
            "dispatch service starting"
        );

        let mut timer = tokio::time::interval(self.dispatch.interval());
        // Skip the first tick to avoid immediate execution.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match self.run_once().await {
                        Ok(counts) if counts.total() > 0 => {
                            info!(
                                sent = counts.sent,
                                failed = counts.failed,
                                requeued = counts.requeued,
                                "dispatch cycle complete"
                            );
                        }
                        Ok(_) => debug!("dispatch cycle complete, nothing to do"),
                        Err(err) => error!(%err, "dispatch cycle failed"),
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown) => info!("dispatch service received shutdown signal"),
                        Err(err) => error!(%err, "dispatch service shutdown channel error"),
                    }
                    break;
                }
            }
        }

        let released = self.lock.release_all();
        if released > 0 {
            info!(released, "released lock leases on shutdown");
        }
        info!("dispatch service shutdown complete");
    }
}
