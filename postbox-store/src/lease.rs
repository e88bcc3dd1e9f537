//! Lease rows backing the distributed lock
//!
//! A lease row represents exclusive ownership of a named resource. The
//! storage layer enforces at most one row per lock name; whether that row is
//! *live* is a question of its expiry instant, judged by the caller.

use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Upper bound on stored lock names; longer names are truncated.
pub const LOCK_NAME_MAX_LEN: usize = 255;

/// Identity of a lock-holding process.
///
/// Generated once at process startup and threaded through every lock
/// operation; two processes never share a token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerToken(String);

impl OwnerToken {
    /// Generate a fresh process identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for OwnerToken {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

/// A time-bounded ownership record for a named lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub name: String,
    pub owner: OwnerToken,
    pub expires_at: DateTime<Utc>,
}

impl LockLease {
    /// Build a lease, truncating the name to the storage bound.
    #[must_use]
    pub fn new(name: &str, owner: OwnerToken, expires_at: DateTime<Utc>) -> Self {
        let name = if name.len() > LOCK_NAME_MAX_LEN {
            let mut end = LOCK_NAME_MAX_LEN;
            while !name.is_char_boundary(end) {
                end -= 1;
            }
            name[..end].to_string()
        } else {
            name.to_string()
        };

        Self {
            name,
            owner,
            expires_at,
        }
    }

    /// A lease past its expiry is considered held by nobody.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Atomic storage for lock leases.
///
/// Implementations must make [`insert_if_absent`](Self::insert_if_absent)
/// atomic with respect to competing inserts: of two racing callers exactly
/// one observes `true`. Database backends typically get this from a unique
/// constraint on the name column.
pub trait LeaseStore: Send + Sync {
    /// Insert the lease unless a row for its name already exists.
    ///
    /// Returns `true` if the insert happened. The existing row's expiry is
    /// not considered; reclaiming expired rows is the caller's business via
    /// [`delete_expired`](Self::delete_expired).
    fn insert_if_absent(&self, lease: LockLease) -> bool;

    /// Fetch the lease row for a name, expired or not.
    fn get(&self, name: &str) -> Option<LockLease>;

    /// Delete the row for `name` if it is owned by `owner`.
    ///
    /// Returns `true` if a row was removed.
    fn delete(&self, name: &str, owner: &OwnerToken) -> bool;

    /// Delete the row for `name` only if it is expired at `now`.
    ///
    /// Used for lease takeover; must be atomic so two reclaiming callers
    /// cannot both believe they removed the row.
    fn delete_expired(&self, name: &str, now: DateTime<Utc>) -> bool;

    /// Remove every lease owned by `owner`, returning how many were removed.
    ///
    /// Best-effort process-exit cleanup.
    fn delete_owned_by(&self, owner: &OwnerToken) -> usize;

    /// All current lease rows, for the administrative surface.
    fn list(&self) -> Vec<LockLease>;

    /// Unconditionally remove the row for `name` regardless of owner.
    ///
    /// Administrative force-clear; returns `true` if a row was removed.
    fn force_clear(&self, name: &str) -> bool;
}

/// In-memory [`LeaseStore`] built on a concurrent map.
///
/// The map's entry API provides the compare-and-insert atomicity a database
/// backend would get from a uniqueness constraint.
#[derive(Debug, Clone, Default)]
pub struct MemoryLeaseStore {
    leases: std::sync::Arc<DashMap<String, LockLease>>,
}

impl MemoryLeaseStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn insert_if_absent(&self, lease: LockLease) -> bool {
        match self.leases.entry(lease.name.clone()) {
            dashmap::Entry::Occupied(_) => false,
            dashmap::Entry::Vacant(slot) => {
                slot.insert(lease);
                true
            }
        }
    }

    fn get(&self, name: &str) -> Option<LockLease> {
        self.leases.get(name).map(|entry| entry.value().clone())
    }

    fn delete(&self, name: &str, owner: &OwnerToken) -> bool {
        self.leases
            .remove_if(name, |_, lease| lease.owner == *owner)
            .is_some()
    }

    fn delete_expired(&self, name: &str, now: DateTime<Utc>) -> bool {
        self.leases
            .remove_if(name, |_, lease| lease.is_expired(now))
            .is_some()
    }

    fn delete_owned_by(&self, owner: &OwnerToken) -> usize {
        let mine: Vec<String> = self
            .leases
            .iter()
            .filter(|entry| entry.value().owner == *owner)
            .map(|entry| entry.key().clone())
            .collect();

        mine.iter()
            .filter(|name| self.delete(name, owner))
            .count()
    }

    fn list(&self) -> Vec<LockLease> {
        self.leases.iter().map(|entry| entry.value().clone()).collect()
    }

    fn force_clear(&self, name: &str) -> bool {
        self.leases.remove(name).is_some()
    }
}
