//! Advisory lock table
//!
//! In-memory, self-expiring locks keyed by operation name. A held lock that is
//! younger than the timeout makes `try_acquire` return `None`; an older one is
//! treated as abandoned and reclaimed. Locks never protect the state store, only
//! the notification side effects of overlapping sync runs.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tabsync_core::{TimeSource, Timestamp};
use tracing::{debug, warn};

/// One held lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub key: String,
    pub acquired_at: Timestamp,
}

/// Lock table owned by one manager instance
pub struct LockTable {
    locks: DashMap<String, Lock>,
    timeout: Duration,
    clock: Arc<dyn TimeSource>,
}

impl LockTable {
    pub fn new(timeout: Duration, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
            clock,
        }
    }

    /// Take the lock for `key` unless a live holder exists
    pub fn try_acquire(&self, key: &str) -> Option<LockGuard<'_>> {
        let now = self.clock.now();
        let lock = Lock {
            key: key.to_string(),
            acquired_at: now,
        };

        match self.locks.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(lock);
            }
            Entry::Occupied(mut slot) => {
                let age = now.duration_since(slot.get().acquired_at);
                if age < self.timeout {
                    debug!(key, age_ms = age.as_millis() as u64, "Lock held; skipping");
                    return None;
                }
                warn!(key, age_ms = age.as_millis() as u64, "Reclaiming abandoned lock");
                slot.insert(lock);
            }
        }

        Some(LockGuard {
            table: self,
            key: key.to_string(),
            acquired_at: now,
        })
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .map(|lock| self.clock.now().duration_since(lock.acquired_at) < self.timeout)
            .unwrap_or(false)
    }

    pub fn held(&self) -> Vec<Lock> {
        self.locks.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop every lock, live or not
    pub fn clear(&self) {
        self.locks.clear();
    }

    fn release(&self, key: &str, acquired_at: Timestamp) {
        // A reclaimed lock belongs to its new holder
        self.locks
            .remove_if(key, |_, lock| lock.acquired_at == acquired_at);
    }
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable")
            .field("held", &self.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Releases its lock on drop
#[derive(Debug)]
pub struct LockGuard<'a> {
    table: &'a LockTable,
    key: String,
    acquired_at: Timestamp,
}

impl LockGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Keep the lock until it expires instead of releasing it on drop
    pub fn leak(self) {
        std::mem::forget(self);
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.table.release(&self.key, self.acquired_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsync_harness::MockTimeSource;

    fn table() -> (LockTable, MockTimeSource) {
        let clock = MockTimeSource::new_at(1_000);
        (LockTable::new(Duration::from_millis(5000), Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_held_lock_blocks_second_acquire() {
        let (table, _) = table();
        let guard = table.try_acquire("syncAll");
        assert!(guard.is_some());
        assert!(table.try_acquire("syncAll").is_none());
        assert!(table.try_acquire("syncTab:1").is_some());
        drop(guard);
        assert!(table.try_acquire("syncAll").is_some());
    }

    #[test]
    fn test_expired_lock_is_reclaimed() {
        let (table, clock) = table();
        if let Some(guard) = table.try_acquire("syncAll") {
            guard.leak();
        }
        assert!(table.is_locked("syncAll"));

        clock.set_time(5_999);
        assert!(table.try_acquire("syncAll").is_none());

        clock.set_time(6_000);
        assert!(!table.is_locked("syncAll"));
        let reclaimed = table.try_acquire("syncAll");
        assert!(reclaimed.is_some());
        assert_eq!(table.held()[0].acquired_at, Timestamp::new(6_000));
    }

    #[test]
    fn test_stale_guard_does_not_release_reclaimed_lock() {
        let (table, clock) = table();
        let stale = table.try_acquire("syncAll");
        clock.set_time(7_000);
        let fresh = table.try_acquire("syncAll");
        assert!(fresh.is_some());

        drop(stale);
        assert!(table.is_locked("syncAll"));
        drop(fresh);
        assert!(table.is_empty());
    }
}
