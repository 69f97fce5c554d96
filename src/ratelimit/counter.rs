//! Window counter record.

use chrono::{DateTime, Duration, Utc};

/// The persisted state of one admission key.
///
/// `version` is an optimistic-concurrency token: a counter read from a store
/// carries the version it was read at, and a write only lands if the stored
/// row still has that version. Stores never reuse a version, even across a
/// delete. A counter that was never persisted has version 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCounter {
    /// Admission key, `"<CATEGORY>:<caller>"`
    pub key: String,
    /// When the current counting window opened
    pub window_start: DateTime<Utc>,
    /// Admitted calls in the current window
    pub count: u64,
    /// Version this counter was read at
    pub version: u64,
}

impl WindowCounter {
    /// A counter for a key that has no stored row yet.
    pub fn fresh(key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            window_start: now,
            count: 0,
            version: 0,
        }
    }

    /// Whether the window has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now >= self.window_start + window
    }

    /// Open a new window over this row, keeping its version so the write
    /// replaces the stale row instead of racing a second insert.
    pub fn reopen(&self, now: DateTime<Utc>) -> Self {
        Self {
            key: self.key.clone(),
            window_start: now,
            count: 0,
            version: self.version,
        }
    }

    /// The same counter with one more admission recorded.
    pub fn incremented(&self) -> Self {
        Self {
            count: self.count + 1,
            ..self.clone()
        }
    }

    /// When the current window closes.
    pub fn window_end(&self, window: Duration) -> DateTime<Utc> {
        self.window_start + window
    }
}
