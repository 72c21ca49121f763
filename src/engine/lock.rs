//! Short-lived per-driver locks that keep two concurrent offers from both
//! turning into accepted assignments for the same driver.
//!
//! Locks are leases: each carries a TTL, so a dispatcher that stalls or dies
//! cannot keep a driver claimed past the offer window.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::LockError;

/// Proof of holding a driver lock. Releasing with a stale token is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

/// At most one live lock per driver at any instant.
///
/// Implementations may be in-process or backed by an external coordination
/// service; either way `acquire` must be atomic with respect to other callers.
#[async_trait]
pub trait AssignmentLocks: Send + Sync {
    /// Returns [`LockError::Held`] if a live lock already exists for the driver.
    async fn acquire(&self, driver_id: Uuid, ttl: Duration) -> Result<LockToken, LockError>;

    /// Returns `false` if the token no longer matches the current holder.
    async fn release(&self, driver_id: Uuid, token: LockToken) -> bool;

    async fn is_locked(&self, driver_id: Uuid) -> bool;
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: LockToken,
    expires_at: Instant,
}

/// Single-process lock manager over a sharded concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryLocks {
    leases: DashMap<Uuid, Lease>,
}

impl InMemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_locks(&self) -> usize {
        let now = Instant::now();
        self.leases
            .iter()
            .filter(|entry| entry.value().expires_at > now)
            .count()
    }
}

#[async_trait]
impl AssignmentLocks for InMemoryLocks {
    async fn acquire(&self, driver_id: Uuid, ttl: Duration) -> Result<LockToken, LockError> {
        let now = Instant::now();
        let lease = Lease {
            token: LockToken::generate(),
            expires_at: now + ttl,
        };

        // the entry guard holds the shard lock, so check-and-set is atomic
        match self.leases.entry(driver_id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return Err(LockError::Held);
                }
                occupied.insert(lease);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(lease);
            }
        }

        Ok(lease.token)
    }

    async fn release(&self, driver_id: Uuid, token: LockToken) -> bool {
        self.leases
            .remove_if(&driver_id, |_, lease| lease.token == token)
            .is_some()
    }

    async fn is_locked(&self, driver_id: Uuid) -> bool {
        self.leases
            .get(&driver_id)
            .is_some_and(|lease| lease.expires_at > Instant::now())
    }
}
