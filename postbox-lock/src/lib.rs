//! Lease-based distributed locking
//!
//! A [`DistributedLock`] serializes work across processes and hosts through
//! lease rows in shared storage ([`postbox_store::LeaseStore`]). Acquiring
//! inserts a row keyed uniquely by lock name; the row carries an expiry
//! instant so a crashed or overrunning holder cannot wedge the resource
//! forever.
//!
//! Three usage shapes, all over the same primitive:
//! - explicit [`DistributedLock::try_acquire`] / [`LeaseGuard::release`]
//! - waiting acquisition via [`DistributedLock::acquire_wait`]
//! - scoped wrapping via [`DistributedLock::with_held`], which guarantees
//!   release on every exit path and enforces the lease timeout on the
//!   protected section cooperatively

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use postbox_store::{LeaseStore, LockLease, OwnerToken};
use thiserror::Error;
use tracing::{debug, warn};

/// Fixed polling granularity for waiting acquisition.
pub const POLL_GRANULARITY: Duration = Duration::from_millis(100);

/// Errors surfaced by lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// A live lease is held by someone else and the caller chose not to wait.
    #[error("lock {0:?} is held by another owner")]
    Locked(String),

    /// The protected section overran the lease timeout and was interrupted.
    /// The lease has been force-cleared.
    #[error("lock {0:?} timed out while held")]
    Timeout(String),

    /// `timeout` was configured below the polling granularity. Raised
    /// eagerly at construction, never at acquire time.
    #[error("lock timeout {configured:?} is below the minimum granularity {minimum:?}")]
    Granularity {
        configured: Duration,
        minimum: Duration,
    },
}

/// Scoped ownership of one acquired lease.
///
/// Dropping the guard releases the lease; [`release`](Self::release) does the
/// same explicitly and is idempotent. Release only ever deletes a row this
/// owner still holds, so a lease that expired and was taken over is left
/// untouched.
#[must_use = "dropping the guard releases the lock"]
pub struct LeaseGuard {
    store: Arc<dyn LeaseStore>,
    name: String,
    owner: OwnerToken,
    released: bool,
}

impl LeaseGuard {
    /// Release the lease. Safe to call more than once.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            if !self.store.delete(&self.name, &self.owner) {
                debug!(name = %self.name, "lease already gone at release (expired or force-cleared)");
            }
        }
    }

    /// The lock name this guard holds.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("LeaseGuard")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

/// Lease-based mutual exclusion over shared storage.
///
/// The owner token is the process identity: generated once at startup and
/// injected, so every lock operation in a process speaks with one voice and
/// exit cleanup can find all of its leases.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LeaseStore>,
    owner: OwnerToken,
    timeout: Duration,
}

impl DistributedLock {
    /// Build a lock handle.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Granularity`] if `timeout` is below the polling
    /// granularity.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        owner: OwnerToken,
        timeout: Duration,
    ) -> Result<Self, LockError> {
        if timeout < POLL_GRANULARITY {
            return Err(LockError::Granularity {
                configured: timeout,
                minimum: POLL_GRANULARITY,
            });
        }

        Ok(Self {
            store,
            owner,
            timeout,
        })
    }

    /// This process's lock identity.
    #[must_use]
    pub const fn owner(&self) -> &OwnerToken {
        &self.owner
    }

    /// The configured lease timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Attempt to take the lock without waiting.
    ///
    /// An expired lease row counts as free and is reclaimed; a live one makes
    /// this fail immediately.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Locked`] if a live lease is held by someone else.
    pub fn try_acquire(&self, name: &str) -> Result<LeaseGuard, LockError> {
        loop {
            let now = Utc::now();
            let lease = LockLease::new(
                name,
                self.owner.clone(),
                now + chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX),
            );
            let stored_name = lease.name.clone();

            if self.store.insert_if_absent(lease) {
                debug!(name = %stored_name, owner = %self.owner, "lock acquired");
                return Ok(self.guard(stored_name));
            }

            match self.store.get(&stored_name) {
                Some(existing) if existing.is_expired(now) => {
                    // Dead holder; clear the row and race for the insert again.
                    if self.store.delete_expired(&stored_name, now) {
                        warn!(
                            name = %stored_name,
                            previous_owner = %existing.owner,
                            "reclaimed expired lease"
                        );
                    }
                }
                Some(_) => return Err(LockError::Locked(stored_name)),
                // Row vanished between insert and get; retry the insert.
                None => {}
            }
        }
    }

    /// Take the lock, polling until the lease is free.
    ///
    /// Never fails with [`LockError::Locked`]; only ever returns once this
    /// process owns the lease. An expired competing lease is treated as free
    /// and taken over even if its original holder is still running.
    pub async fn acquire_wait(&self, name: &str) -> LeaseGuard {
        loop {
            match self.try_acquire(name) {
                Ok(guard) => return guard,
                Err(_) => tokio::time::sleep(POLL_GRANULARITY).await,
            }
        }
    }

    /// Run `section` while holding the lock, releasing on every exit path.
    ///
    /// The section runs under the lease timeout: if it overruns, it is
    /// cancelled, the lease is released, and [`LockError::Timeout`] is
    /// returned. With `wait` false, contention surfaces as
    /// [`LockError::Locked`]; with `wait` true the call blocks (polling)
    /// until the lease is free.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Locked`] on contention (non-waiting mode only)
    /// or [`LockError::Timeout`] if the section overruns.
    pub async fn with_held<T, Fut>(
        &self,
        name: &str,
        wait: bool,
        section: impl FnOnce() -> Fut,
    ) -> Result<T, LockError>
    where
        Fut: Future<Output = T>,
    {
        let mut guard = if wait {
            self.acquire_wait(name).await
        } else {
            self.try_acquire(name)?
        };

        let outcome = tokio::time::timeout(self.timeout, section()).await;
        guard.release();

        match outcome {
            Ok(value) => Ok(value),
            Err(_) => {
                warn!(name = %name, timeout = ?self.timeout, "protected section overran lock timeout");
                Err(LockError::Timeout(name.to_string()))
            }
        }
    }

    /// Best-effort release of every lease this process owns.
    ///
    /// Called from the process-exit path; returns how many leases were
    /// cleared.
    pub fn release_all(&self) -> usize {
        let cleared = self.store.delete_owned_by(&self.owner);
        if cleared > 0 {
            debug!(owner = %self.owner, cleared, "released remaining leases at exit");
        }
        cleared
    }

    /// All current lease rows, for inspection.
    #[must_use]
    pub fn leases(&self) -> Vec<LockLease> {
        self.store.list()
    }

    /// Administrative force-clear of a lease regardless of owner.
    pub fn force_clear(&self, name: &str) -> bool {
        self.store.force_clear(name)
    }

    fn guard(&self, name: String) -> LeaseGuard {
        LeaseGuard {
            store: Arc::clone(&self.store),
            name,
            owner: self.owner.clone(),
            released: false,
        }
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("DistributedLock")
            .field("owner", &self.owner)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Instant;

    use postbox_store::MemoryLeaseStore;

    use super::*;

    fn lock_with(store: &Arc<MemoryLeaseStore>, timeout: Duration) -> DistributedLock {
        let store: Arc<dyn LeaseStore> = Arc::clone(store) as Arc<dyn LeaseStore>;
        DistributedLock::new(store, OwnerToken::generate(), timeout).unwrap()
    }

    #[test]
    fn granularity_is_checked_eagerly() {
        let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
        let result = DistributedLock::new(store, OwnerToken::generate(), Duration::from_millis(50));
        assert!(matches!(result, Err(LockError::Granularity { .. })));
    }

    #[test]
    fn second_acquire_fails_immediately() {
        let store = Arc::new(MemoryLeaseStore::new());
        let first = lock_with(&store, Duration::from_secs(60));
        let second = lock_with(&store, Duration::from_secs(60));

        let _held = first.try_acquire("dispatch").unwrap();

        let started = Instant::now();
        let result = second.try_acquire("dispatch");
        assert!(matches!(result, Err(LockError::Locked(_))));
        // Non-waiting acquire never blocks.
        assert!(started.elapsed() < POLL_GRANULARITY);
    }

    #[test]
    fn release_frees_the_lock() {
        let store = Arc::new(MemoryLeaseStore::new());
        let first = lock_with(&store, Duration::from_secs(60));
        let second = lock_with(&store, Duration::from_secs(60));

        let mut held = first.try_acquire("dispatch").unwrap();
        held.release();
        held.release(); // idempotent

        assert!(second.try_acquire("dispatch").is_ok());
    }

    #[test]
    fn dropping_the_guard_releases() {
        let store = Arc::new(MemoryLeaseStore::new());
        let first = lock_with(&store, Duration::from_secs(60));
        let second = lock_with(&store, Duration::from_secs(60));

        {
            let _held = first.try_acquire("dispatch").unwrap();
        }
        assert!(second.try_acquire("dispatch").is_ok());
    }

    #[tokio::test]
    async fn waiting_acquire_unblocks_on_release() {
        let store = Arc::new(MemoryLeaseStore::new());
        let holder = lock_with(&store, Duration::from_secs(60));
        let waiter = lock_with(&store, Duration::from_secs(60));

        let mut held = holder.try_acquire("dispatch").unwrap();

        let handle = tokio::spawn(async move { waiter.acquire_wait("dispatch").await });

        tokio::time::sleep(Duration::from_millis(250)).await;
        let released_at = Instant::now();
        held.release();

        let guard = handle.await.unwrap();
        // Completes within roughly one polling interval of the release.
        assert!(released_at.elapsed() < POLL_GRANULARITY * 3);
        drop(guard);
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let store = Arc::new(MemoryLeaseStore::new());
        let holder = lock_with(&store, Duration::from_millis(150));
        let claimant = lock_with(&store, Duration::from_secs(60));

        // Holder never releases; we only let its lease expire.
        let held = holder.try_acquire("dispatch").unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let guard = claimant.acquire_wait("dispatch").await;
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.list()[0].owner, *claimant.owner());

        drop(guard);
        drop(held);
    }

    #[tokio::test]
    async fn with_held_releases_on_success() {
        let store = Arc::new(MemoryLeaseStore::new());
        let lock = lock_with(&store, Duration::from_secs(60));

        let value = lock
            .with_held("dispatch", false, || async { 42 })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn with_held_interrupts_overrunning_section() {
        let store = Arc::new(MemoryLeaseStore::new());
        let lock = lock_with(&store, Duration::from_millis(150));

        let result: Result<(), LockError> = lock
            .with_held("dispatch", false, || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
            })
            .await;

        assert!(matches!(result, Err(LockError::Timeout(_))));
        // Lease force-cleared on the way out.
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn with_held_surfaces_contention() {
        let store = Arc::new(MemoryLeaseStore::new());
        let holder = lock_with(&store, Duration::from_secs(60));
        let other = lock_with(&store, Duration::from_secs(60));

        let _held = holder.try_acquire("dispatch").unwrap();

        let result: Result<(), LockError> =
            other.with_held("dispatch", false, || async {}).await;
        assert!(matches!(result, Err(LockError::Locked(_))));
    }

    #[test]
    fn release_all_clears_own_leases() {
        let store = Arc::new(MemoryLeaseStore::new());
        let lock = lock_with(&store, Duration::from_secs(60));

        let mut a = lock.try_acquire("a").unwrap();
        let mut b = lock.try_acquire("b").unwrap();

        assert_eq!(lock.release_all(), 2);
        assert!(lock.leases().is_empty());

        // Guards notice the rows are gone without complaint.
        a.release();
        b.release();
    }
}
