//! Lease coordination for settlement and rebate runs
//!
//! The scheduler, the recovery sweep and manual retries may all try to settle
//! or distribute the same period. A lease keyed by (scope, period) lets one
//! run proceed; the others return a no-op. Every lease carries an owner token
//! and a TTL so a crashed holder is taken over once the TTL lapses, and a
//! guard releases it on drop only while the token still matches.

use crate::common::types::PeriodId;
use crate::errors::LeaseError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// What a lease protects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseScope {
    Settlement,
    Rebate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseKey {
    pub scope: LeaseScope,
    pub period: PeriodId,
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = match self.scope {
            LeaseScope::Settlement => "settlement",
            LeaseScope::Rebate => "rebate",
        };
        write!(f, "{}:{}", scope, self.period)
    }
}

#[derive(Debug, Clone, Copy)]
struct LeaseEntry {
    owner: Uuid,
    expires_at: Instant,
}

impl LeaseEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process lease table
#[derive(Debug, Clone, Default)]
pub struct ConsistencyCoordinator {
    leases: Arc<DashMap<LeaseKey, LeaseEntry>>,
}

impl ConsistencyCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lease for (scope, period), taking over an expired holder
    pub fn try_acquire(&self, scope: LeaseScope, period: PeriodId, ttl: Duration) -> Result<LeaseGuard, LeaseError> {
        let key = LeaseKey { scope, period };
        let now = Instant::now();
        let owner = Uuid::new_v4();
        let fresh = LeaseEntry {
            owner,
            expires_at: now + ttl,
        };

        match self.leases.entry(key) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now) {
                    return Err(LeaseError::LeaseUnavailable(key.to_string()));
                }
                warn!(lease = %key, "Taking over expired lease");
                occupied.insert(fresh);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
            }
        }

        debug!(lease = %key, owner = %owner, "Lease acquired");
        Ok(LeaseGuard {
            leases: Arc::clone(&self.leases),
            key,
            owner,
            ttl,
        })
    }

    /// Whether any live lease exists for (scope, period)
    pub fn is_leased(&self, scope: LeaseScope, period: PeriodId) -> bool {
        let now = Instant::now();
        self.leases
            .get(&LeaseKey { scope, period })
            .map_or(false, |entry| !entry.is_expired(now))
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.leases.len();
        self.leases.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.leases.len())
    }
}

/// Held lease; released on drop if still owned
#[derive(Debug)]
pub struct LeaseGuard {
    leases: Arc<DashMap<LeaseKey, LeaseEntry>>,
    key: LeaseKey,
    owner: Uuid,
    ttl: Duration,
}

impl LeaseGuard {
    pub fn key(&self) -> LeaseKey {
        self.key
    }

    /// True while this guard's token is the live holder
    pub fn is_held(&self) -> bool {
        let now = Instant::now();
        self.leases
            .get(&self.key)
            .map_or(false, |entry| entry.owner == self.owner && !entry.is_expired(now))
    }

    /// Extend the TTL from now; fails if the lease was lost
    pub fn renew(&self) -> Result<(), LeaseError> {
        let now = Instant::now();
        match self.leases.get_mut(&self.key) {
            Some(mut entry) if entry.owner == self.owner && !entry.is_expired(now) => {
                entry.expires_at = now + self.ttl;
                Ok(())
            }
            _ => Err(LeaseError::Expired(self.key.to_string())),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let owner = self.owner;
        if self.leases.remove_if(&self.key, |_, entry| entry.owner == owner).is_some() {
            debug!(lease = %self.key, "Lease released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn test_second_acquire_is_rejected() {
        let coordinator = ConsistencyCoordinator::new();
        let guard = coordinator.try_acquire(LeaseScope::Settlement, PeriodId(1), TTL).unwrap();
        assert!(guard.is_held());

        let err = coordinator.try_acquire(LeaseScope::Settlement, PeriodId(1), TTL).unwrap_err();
        assert!(matches!(err, LeaseError::LeaseUnavailable(_)));

        // Different scope and different period are independent
        assert!(coordinator.try_acquire(LeaseScope::Rebate, PeriodId(1), TTL).is_ok());
        assert!(coordinator.try_acquire(LeaseScope::Settlement, PeriodId(2), TTL).is_ok());
    }

    #[test]
    fn test_drop_releases() {
        let coordinator = ConsistencyCoordinator::new();
        {
            let _guard = coordinator.try_acquire(LeaseScope::Rebate, PeriodId(7), TTL).unwrap();
            assert!(coordinator.is_leased(LeaseScope::Rebate, PeriodId(7)));
        }
        assert!(!coordinator.is_leased(LeaseScope::Rebate, PeriodId(7)));
        assert!(coordinator.try_acquire(LeaseScope::Rebate, PeriodId(7), TTL).is_ok());
    }

    #[test]
    fn test_expired_lease_is_taken_over() {
        let coordinator = ConsistencyCoordinator::new();
        let stale = coordinator
            .try_acquire(LeaseScope::Settlement, PeriodId(3), Duration::from_millis(0))
            .unwrap();
        assert!(!stale.is_held());

        let fresh = coordinator.try_acquire(LeaseScope::Settlement, PeriodId(3), TTL).unwrap();
        assert!(fresh.is_held());
        assert!(stale.renew().is_err());

        // The stale guard must not release the new holder's lease
        drop(stale);
        assert!(fresh.is_held());
    }

    #[test]
    fn test_renew_extends_ttl() {
        let coordinator = ConsistencyCoordinator::new();
        let guard = coordinator
            .try_acquire(LeaseScope::Settlement, PeriodId(4), Duration::from_millis(50))
            .unwrap();
        assert!(guard.renew().is_ok());
        assert!(guard.is_held());
    }

    #[test]
    fn test_purge_expired() {
        let coordinator = ConsistencyCoordinator::new();
        let stale = coordinator
            .try_acquire(LeaseScope::Settlement, PeriodId(5), Duration::from_millis(0))
            .unwrap();
        let _live = coordinator.try_acquire(LeaseScope::Settlement, PeriodId(6), TTL).unwrap();
        assert_eq!(coordinator.purge_expired(), 1);
        drop(stale);
        assert!(coordinator.is_leased(LeaseScope::Settlement, PeriodId(6)));
    }
}
