//! Core window rate limiter implementation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::counter::WindowCounter;
use super::retention::SweepSchedule;
use crate::config::{FailurePolicy, LimiterConfig};
use crate::error::{ReadgateError, Result, StoreResult};
use crate::store::CounterStore;

/// Outcome of one read-check-write attempt.
#[derive(Debug)]
enum Attempt {
    Admitted { count: u64, opened: bool },
    Rejected { count: u64 },
    Conflict,
}

/// Per-key fixed window rate limiter over a shared [`CounterStore`].
///
/// Each key gets its own rolling window that opens on the first call after
/// the previous window expired. The check and the increment form one
/// optimistic transaction against the store: a write only lands if nobody
/// else wrote the counter since it was read, and conflicting attempts are
/// retried a bounded number of times.
pub struct WindowRateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    config: LimiterConfig,
    schedule: SweepSchedule,
}

impl WindowRateLimiter {
    /// Create a new limiter.
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        config: LimiterConfig,
    ) -> Result<Self> {
        config.validate()?;
        let schedule = SweepSchedule::new(config.retention(), clock.now());

        Ok(Self {
            store,
            clock,
            config,
            schedule,
        })
    }

    /// Create a new limiter reading wall-clock time.
    pub fn with_system_clock(store: Arc<dyn CounterStore>, config: LimiterConfig) -> Result<Self> {
        Self::new(store, Arc::new(SystemClock), config)
    }

    /// Let the retention sweep know about a window before any call uses it.
    pub fn observe_window(&self, window: Duration) {
        if let Ok(window) = chrono::Duration::from_std(window) {
            self.schedule.observe_window(window);
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.config.failure_policy
    }

    /// Try to admit one call for `key`.
    ///
    /// Returns `Ok(true)` when admitted and `Ok(false)` when the key is over
    /// its limit for the current window. Store failures and exhausted retries
    /// are resolved through the configured [`FailurePolicy`]. `Err` is only
    /// returned for arguments no limiter could honor.
    pub async fn try_consume(&self, key: &str, limit: u64, window: Duration) -> Result<bool> {
        let span = self.validate(key, limit, window)?;
        self.schedule.observe_window(span);

        trace!(key, limit, window_ms = span.num_milliseconds(), "Checking rate limit");

        let max_attempts = self.attempt_budget(limit);
        for attempt in 1..=max_attempts {
            let now = self.clock.now();

            match self.attempt(key, limit, span, now).await {
                Ok(Attempt::Admitted { count, opened }) => {
                    if opened {
                        debug!(key, "Opened new rate limit window");
                    }
                    trace!(key, count, limit, "Admitted");
                    self.maybe_sweep(now);
                    return Ok(true);
                }
                Ok(Attempt::Rejected { count }) => {
                    debug!(key, count, limit, "Rate limit exceeded");
                    return Ok(false);
                }
                Ok(Attempt::Conflict) => {
                    trace!(key, attempt, "Counter changed concurrently, retrying");
                    if attempt < max_attempts {
                        self.backoff(attempt).await;
                    }
                }
                Err(e) => return Ok(self.degraded(key, &e)),
            }
        }

        Ok(self.degraded(
            key,
            &format!("gave up after {} conflicting attempts", max_attempts),
        ))
    }

    /// One optimistic read-check-write against the store.
    async fn attempt(
        &self,
        key: &str,
        limit: u64,
        window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Attempt> {
        let (counter, opened) = match self.store.find(key).await? {
            Some(current) if !current.is_expired(now, window) => (current, false),
            Some(stale) => (stale.reopen(now), true),
            None => (WindowCounter::fresh(key, now), true),
        };

        if counter.count >= limit {
            return Ok(Attempt::Rejected {
                count: counter.count,
            });
        }

        let next = counter.incremented();
        if self.store.upsert(&next).await? {
            Ok(Attempt::Admitted {
                count: next.count,
                opened,
            })
        } else {
            Ok(Attempt::Conflict)
        }
    }

    /// Attempts allowed for one call.
    ///
    /// Every conflict is another caller's admission, so `limit + 1` attempts
    /// always end in a decision unless something other than admissions
    /// (a reset or a sweep) keeps changing the row.
    fn attempt_budget(&self, limit: u64) -> u32 {
        let needed = u32::try_from(limit.saturating_add(1)).unwrap_or(u32::MAX);
        self.config.max_attempts.max(needed)
    }

    fn validate(&self, key: &str, limit: u64, window: Duration) -> Result<chrono::Duration> {
        if key.is_empty() {
            return Err(ReadgateError::InvalidArgument(
                "admission key must not be empty".to_string(),
            ));
        }
        if limit == 0 {
            return Err(ReadgateError::InvalidArgument(format!(
                "limit for {} must be greater than zero",
                key
            )));
        }
        if window.is_zero() {
            return Err(ReadgateError::InvalidArgument(format!(
                "window for {} must be greater than zero",
                key
            )));
        }

        chrono::Duration::from_std(window)
            .ok()
            .filter(|span| self.clock.now().checked_add_signed(*span).is_some())
            .ok_or_else(|| {
                ReadgateError::InvalidArgument(format!("window for {} is too large", key))
            })
    }

    async fn backoff(&self, attempt: u32) {
        let base = self.config.retry_backoff_ms;
        if base == 0 {
            tokio::task::yield_now().await;
            return;
        }

        let jitter = rand::thread_rng().gen_range(0..=base);
        let delay = base.saturating_mul(u64::from(attempt)).saturating_add(jitter);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    fn degraded(&self, key: &str, reason: &dyn fmt::Display) -> bool {
        let admitted = self.config.failure_policy.admits();
        warn!(
            key,
            reason = %reason,
            policy = ?self.config.failure_policy,
            admitted,
            "Rate limit decision degraded"
        );
        admitted
    }

    /// Kick off a bulk sweep in the background when one is due.
    fn maybe_sweep(&self, now: DateTime<Utc>) {
        let Some(cutoff) = self.schedule.claim(now) else {
            return;
        };

        let store = Arc::clone(&self.store);
        let sweep = async move {
            match store.delete_expired_before(cutoff).await {
                Ok(removed) => debug!(removed, %cutoff, "Swept expired counters"),
                Err(e) => warn!(error = %e, %cutoff, "Failed to sweep expired counters"),
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(sweep);
            }
            Err(_) => debug!("No runtime available, skipping opportunistic sweep"),
        }
    }

    /// Remove every counter past the retention cutoff now.
    ///
    /// Returns the number of removed counters.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let cutoff = self.schedule.cutoff(now);
        self.schedule.mark_swept(now);

        let removed = self.store.delete_expired_before(cutoff).await?;
        debug!(removed, %cutoff, "Swept expired counters");
        Ok(removed)
    }

    /// Time between bulk sweeps for the widest window observed so far.
    pub fn sweep_period(&self) -> Duration {
        self.schedule.period().to_std().unwrap_or_default()
    }

    /// Widest window observed so far.
    pub fn widest_window(&self) -> Duration {
        self.schedule.widest_window().to_std().unwrap_or_default()
    }

    /// Admitted calls for `key` in its current window.
    ///
    /// Absent and expired counters both count as zero.
    pub async fn current_count(&self, key: &str, window: Duration) -> Result<u64> {
        let span = chrono::Duration::from_std(window)
            .map_err(|_| ReadgateError::InvalidArgument(format!("window for {} is too large", key)))?;
        let now = self.clock.now();

        let count = self
            .store
            .find(key)
            .await?
            .filter(|counter| !counter.is_expired(now, span))
            .map(|counter| counter.count)
            .unwrap_or(0);

        Ok(count)
    }

    /// Forget the counter for `key`.
    ///
    /// Returns whether a counter existed.
    pub async fn reset(&self, key: &str) -> Result<bool> {
        let existed = self.store.delete(key).await?;
        debug!(key, existed, "Reset rate limit counter");
        Ok(existed)
    }
}
