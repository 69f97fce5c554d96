//! In-process counter store.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::CounterStore;
use crate::error::StoreResult;
use crate::ratelimit::WindowCounter;

/// Counter store backed by a sharded concurrent map.
///
/// Writes for different keys only contend when they hash to the same shard,
/// and a conditional write holds that shard for a single comparison.
/// Versions come from one store-wide sequence.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    rows: DashMap<String, WindowCounter>,
    last_version: AtomicU64,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored counters.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn find(&self, key: &str) -> StoreResult<Option<WindowCounter>> {
        Ok(self.rows.get(key).map(|row| row.value().clone()))
    }

    async fn upsert(&self, counter: &WindowCounter) -> StoreResult<bool> {
        let next_version = || self.last_version.fetch_add(1, Ordering::Relaxed) + 1;
        let stored = |version| WindowCounter {
            version,
            ..counter.clone()
        };

        let applied = match self.rows.entry(counter.key.clone()) {
            Entry::Occupied(mut row) => {
                if row.get().version == counter.version {
                    row.insert(stored(next_version()));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                if counter.version == 0 {
                    slot.insert(stored(next_version()));
                    true
                } else {
                    // Swept or reset since it was read
                    false
                }
            }
        };

        Ok(applied)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.rows.remove(key).is_some())
    }

    async fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut removed = 0u64;
        self.rows.retain(|_, row| {
            let keep = row.window_start >= cutoff;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}
