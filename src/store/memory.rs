use super::CounterStore;
use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    value: i64,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process counter store with the same first-increment expiry rule as
/// the Redis script. Only meaningful for a single instance.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a live key.
    pub fn value(&self, key: &str) -> Option<i64> {
        let now = Instant::now();
        self.slots
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| slot.value)
    }

    /// When a live key will expire.
    pub fn expires_at(&self, key: &str) -> Option<Instant> {
        let now = Instant::now();
        self.slots
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .and_then(|slot| slot.expires_at)
    }

    /// Drop expired keys.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        self.slots.retain(|_, slot| {
            let expired = slot.is_expired(now);
            if expired {
                purged += 1;
            }
            !expired
        });
        purged
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr_with_first_expiry(
        &self,
        key: &str,
        by: i64,
        ttl: Duration,
    ) -> Result<Option<i64>, StoreError> {
        let now = Instant::now();
        // The entry guard holds the shard lock for the whole read-modify-write.
        let mut slot = self.slots.entry(key.to_string()).or_default();
        if slot.is_expired(now) {
            *slot = Slot::default();
        }

        slot.value += by;
        if slot.value == by {
            slot.expires_at = Some(now + ttl);
        }
        Ok(Some(slot.value))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
