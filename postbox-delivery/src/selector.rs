//! Batch selection of dispatch-eligible messages

use std::sync::Arc;

use chrono::{DateTime, Utc};
use postbox_common::Message;
use postbox_store::MessageStore;
use tracing::debug;

use crate::error::DispatchError;

/// Selects the next batch of dispatch-eligible messages.
///
/// The selection predicate and ordering live in the store query (status
/// queued or requeued, scheduled time absent or due; priority descending,
/// then arrival order). Exclusive handout within a run is the runner's job:
/// it partitions the batch before any worker sees it, and the distributed
/// lock keeps whole runs from overlapping.
#[derive(Clone)]
pub struct BatchSelector {
    store: Arc<dyn MessageStore>,
}

impl BatchSelector {
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Fetch up to `batch_size` eligible messages at `now`.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn select(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<Message>, DispatchError> {
        let batch = self.store.query_eligible(now, batch_size).await?;
        debug!(count = batch.len(), batch_size, "selected dispatch batch");
        Ok(batch)
    }
}

impl std::fmt::Debug for BatchSelector {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("BatchSelector").finish_non_exhaustive()
    }
}
