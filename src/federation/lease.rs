// Keyfed — Lease Manager
//
// Wraps the lease table with a clock and TTL policy. Acquisition is a
// single conditional write against the shared store; a crashed holder
// delays its partner by at most one TTL.

use std::sync::Arc;

use chrono::Duration;

use crate::clock::Clock;
use crate::store::{LeaseStore, StoreError};

pub struct LeaseManager<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: LeaseStore> LeaseManager<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Try to take the partner's lease for `ttl`. Returns false when a
    /// live lease is held by anyone, including `holder` itself.
    pub fn acquire(&self, partner: &str, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        check_ttl(ttl)?;
        let now = self.clock.now();
        let acquired = self.store.try_acquire(partner, holder, now, now + ttl)?;

        if acquired {
            tracing::debug!(partner = %partner, holder = %holder, ttl_secs = ttl.num_seconds(), "Lease acquired");
        } else {
            tracing::debug!(partner = %partner, holder = %holder, "Lease held elsewhere");
        }
        Ok(acquired)
    }

    /// Extend a lease the caller still holds. False means it was lost.
    pub fn renew(&self, partner: &str, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        check_ttl(ttl)?;
        let now = self.clock.now();
        if self.store.renew(partner, holder, now, now + ttl)? {
            return Ok(true);
        }

        match self.store.get_lease(partner)? {
            Some(lease) if lease.holder != holder => tracing::warn!(
                partner = %partner,
                holder = %holder,
                taken_by = %lease.holder,
                expired = lease.is_expired(now),
                "Lease lost to another holder"
            ),
            Some(_) => tracing::warn!(partner = %partner, holder = %holder, "Lease expired before renewal"),
            None => tracing::warn!(partner = %partner, holder = %holder, "Lease vanished before renewal"),
        }
        Ok(false)
    }

    pub fn release(&self, partner: &str, holder: &str) -> Result<(), StoreError> {
        if !self.store.release(partner, holder)? {
            tracing::warn!(
                partner = %partner,
                holder = %holder,
                "Lease was no longer held at release"
            );
        }
        Ok(())
    }
}

fn check_ttl(ttl: Duration) -> Result<(), StoreError> {
    if ttl <= Duration::zero() {
        return Err(StoreError::InvalidTtl(ttl.num_milliseconds()));
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{Database, SqliteStore};

    fn setup() -> (LeaseManager<SqliteStore>, Arc<ManualClock>) {
        let store = Arc::new(SqliteStore::new(Arc::new(Database::open_in_memory().unwrap())));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (LeaseManager::new(store, clock.clone()), clock)
    }

    #[test]
    fn test_crashed_holder_blocks_for_exactly_ttl() {
        let (leases, clock) = setup();
        let ttl = Duration::minutes(5);
        assert!(leases.acquire("de", "crashed-worker", ttl).unwrap());

        clock.advance(Duration::minutes(4) + Duration::seconds(59));
        assert!(!leases.acquire("de", "worker-2", ttl).unwrap(), "still held before ttl");

        clock.advance(Duration::seconds(1));
        assert!(leases.acquire("de", "worker-2", ttl).unwrap(), "reclaimable at ttl");
    }

    #[test]
    fn test_renew_extends_past_original_expiry() {
        let (leases, clock) = setup();
        let ttl = Duration::minutes(5);
        leases.acquire("de", "w1", ttl).unwrap();

        clock.advance(Duration::minutes(4));
        assert!(leases.renew("de", "w1", ttl).unwrap());

        clock.advance(Duration::minutes(4));
        assert!(!leases.acquire("de", "w2", ttl).unwrap(), "renewed lease still live");
    }

    #[test]
    fn test_renew_fails_once_expired_or_taken() {
        let (leases, clock) = setup();
        let ttl = Duration::minutes(5);
        leases.acquire("de", "w1", ttl).unwrap();

        clock.advance(Duration::minutes(5));
        assert!(!leases.renew("de", "w1", ttl).unwrap(), "expired lease cannot be revived");

        assert!(leases.acquire("de", "w2", ttl).unwrap());
        assert!(!leases.renew("de", "w1", ttl).unwrap(), "taken lease stays with w2");
        assert!(leases.renew("de", "w2", ttl).unwrap());
    }

    #[test]
    fn test_release_frees_immediately() {
        let (leases, _clock) = setup();
        let ttl = Duration::minutes(5);
        leases.acquire("de", "w1", ttl).unwrap();
        leases.release("de", "w1").unwrap();
        assert!(leases.acquire("de", "w2", ttl).unwrap());
    }

    #[test]
    fn test_non_positive_ttl_rejected() {
        let (leases, _clock) = setup();
        assert!(leases.acquire("de", "w1", Duration::zero()).is_err());
        assert!(leases.renew("de", "w1", Duration::seconds(-1)).is_err());
    }
}
