//! Retention policy for cold counters.
//!
//! A queried key is always corrected lazily by the limiter. The bulk sweep
//! only reclaims rows for keys nobody asks about anymore.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::limiter::WindowRateLimiter;
use crate::error::{ReadgateError, Result};

/// How often the bulk sweep runs and how far back it reaches.
///
/// Both values are measured in widths of the widest window the limiter
/// serves, so a row is only ever swept after its own window has expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Sweep at most once per this many windows
    pub sweep_interval_windows: u32,
    /// Keep rows for this many windows after they opened
    pub retention_multiplier: u32,
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_windows == 0 {
            return Err(ReadgateError::Config(
                "limiter.sweep_interval_windows must be at least 1".to_string(),
            ));
        }
        if self.retention_multiplier == 0 {
            return Err(ReadgateError::Config(
                "limiter.retention_multiplier must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tracks the widest window seen and when the last sweep ran.
///
/// Lock-free so admission checks never wait on sweep bookkeeping.
#[derive(Debug)]
pub(crate) struct SweepSchedule {
    policy: RetentionPolicy,
    widest_window_ms: AtomicI64,
    last_sweep_ms: AtomicI64,
}

impl SweepSchedule {
    pub(crate) fn new(policy: RetentionPolicy, started_at: DateTime<Utc>) -> Self {
        Self {
            policy,
            widest_window_ms: AtomicI64::new(0),
            last_sweep_ms: AtomicI64::new(started_at.timestamp_millis()),
        }
    }

    pub(crate) fn observe_window(&self, window: chrono::Duration) {
        self.widest_window_ms
            .fetch_max(window.num_milliseconds(), Ordering::Relaxed);
    }

    pub(crate) fn widest_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.widest_window_ms.load(Ordering::Relaxed))
    }

    /// Time between sweeps.
    pub(crate) fn period(&self) -> chrono::Duration {
        let ms = self
            .widest_window_ms
            .load(Ordering::Relaxed)
            .saturating_mul(i64::from(self.policy.sweep_interval_windows));
        chrono::Duration::milliseconds(ms)
    }

    /// Rows whose window opened before this instant are swept.
    pub(crate) fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ms = self
            .widest_window_ms
            .load(Ordering::Relaxed)
            .saturating_mul(i64::from(self.policy.retention_multiplier));
        now.checked_sub_signed(chrono::Duration::milliseconds(ms))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Claim the next sweep if one is due at `now`.
    ///
    /// At most one concurrent caller wins the claim. Returns the cutoff to
    /// sweep with.
    pub(crate) fn claim(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.widest_window_ms.load(Ordering::Relaxed) == 0 {
            return None;
        }

        let now_ms = now.timestamp_millis();
        let last = self.last_sweep_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(last) < self.period().num_milliseconds() {
            return None;
        }

        self.last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| self.cutoff(now))
    }

    /// Record a sweep that ran outside of [`claim`](Self::claim).
    pub(crate) fn mark_swept(&self, now: DateTime<Utc>) {
        self.last_sweep_ms
            .fetch_max(now.timestamp_millis(), Ordering::AcqRel);
    }
}

/// Background task that sweeps expired counters on a fixed period.
pub struct RetentionSweeper {
    limiter: Arc<WindowRateLimiter>,
    period: Duration,
}

impl RetentionSweeper {
    /// Create a sweeper that runs once per the limiter's sweep period.
    ///
    /// `min_period` bounds the period from below when no window has been
    /// observed yet. The period is never shorter than one second.
    pub fn new(limiter: Arc<WindowRateLimiter>, min_period: Duration) -> Self {
        let period = limiter
            .sweep_period()
            .max(min_period)
            .max(Duration::from_secs(1));
        Self { limiter, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Sweep on every tick until `shutdown` completes.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(period_secs = self.period.as_secs(), "Retention sweeper started");

        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    match self.limiter.sweep_expired().await {
                        Ok(removed) => debug!(removed, "Retention sweep finished"),
                        Err(e) => warn!(error = %e, "Retention sweep failed"),
                    }
                }
            }
        }

        info!("Retention sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn schedule(sweep_interval_windows: u32, retention_multiplier: u32) -> SweepSchedule {
        SweepSchedule::new(
            RetentionPolicy {
                sweep_interval_windows,
                retention_multiplier,
            },
            t0(),
        )
    }

    #[test]
    fn test_policy_validation() {
        let ok = RetentionPolicy {
            sweep_interval_windows: 1,
            retention_multiplier: 1,
        };
        tokio_test::assert_ok!(ok.validate());

        let no_interval = RetentionPolicy {
            sweep_interval_windows: 0,
            ..ok
        };
        tokio_test::assert_err!(no_interval.validate());

        let no_retention = RetentionPolicy {
            retention_multiplier: 0,
            ..ok
        };
        tokio_test::assert_err!(no_retention.validate());
    }

    #[test]
    fn test_widest_window_only_grows() {
        let schedule = schedule(10, 2);
        schedule.observe_window(chrono::Duration::seconds(60));
        schedule.observe_window(chrono::Duration::seconds(1));
        assert_eq!(schedule.widest_window(), chrono::Duration::seconds(60));
        assert_eq!(schedule.period(), chrono::Duration::seconds(600));
    }

    #[test]
    fn test_cutoff_uses_retention_multiplier() {
        let schedule = schedule(10, 3);
        schedule.observe_window(chrono::Duration::seconds(60));
        let now = t0() + chrono::Duration::hours(1);
        assert_eq!(schedule.cutoff(now), now - chrono::Duration::seconds(180));
    }

    #[test]
    fn test_no_sweep_before_any_window() {
        let schedule = schedule(1, 1);
        assert!(schedule.claim(t0() + chrono::Duration::days(1)).is_none());
    }

    #[test]
    fn test_claim_once_per_period() {
        let schedule = schedule(2, 2);
        schedule.observe_window(chrono::Duration::seconds(60));

        // Period is two windows from the start time
        assert!(schedule.claim(t0() + chrono::Duration::seconds(119)).is_none());

        let now = t0() + chrono::Duration::seconds(120);
        assert_eq!(schedule.claim(now), Some(now - chrono::Duration::seconds(120)));

        // Already claimed for this period
        assert!(schedule.claim(now).is_none());
        assert!(schedule.claim(now + chrono::Duration::seconds(60)).is_none());
        assert!(schedule.claim(now + chrono::Duration::seconds(120)).is_some());
    }

    #[test]
    fn test_mark_swept_pushes_next_claim() {
        let schedule = schedule(1, 1);
        schedule.observe_window(chrono::Duration::seconds(60));

        schedule.mark_swept(t0() + chrono::Duration::seconds(50));
        assert!(schedule.claim(t0() + chrono::Duration::seconds(60)).is_none());
        assert!(schedule.claim(t0() + chrono::Duration::seconds(110)).is_some());
    }
}
