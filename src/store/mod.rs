//! Counter storage.
//!
//! The limiter only talks to storage through [`CounterStore`], so its
//! correctness logic does not depend on where counters live.

mod memory;
mod postgres;

pub use memory::MemoryCounterStore;
pub use postgres::PostgresCounterStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use crate::ratelimit::WindowCounter;

/// Trait for window counter stores.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Look up the counter for a key.
    async fn find(&self, key: &str) -> StoreResult<Option<WindowCounter>>;

    /// Conditionally write a counter.
    ///
    /// The write applies only if the stored row still has `counter.version`
    /// (or, for version 0, if no row exists). On success the row gets a
    /// version the store has never handed out before, for any key, so a row
    /// that was deleted and recreated never matches a version read from its
    /// predecessor. A `false` return means another writer got there first and
    /// the caller should re-read.
    async fn upsert(&self, counter: &WindowCounter) -> StoreResult<bool>;

    /// Remove the counter for a key, returning whether one existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Remove every counter whose window opened before `cutoff`.
    ///
    /// Returns the number of removed rows.
    async fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}
