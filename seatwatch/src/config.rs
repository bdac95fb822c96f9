use std::{num::NonZeroU32, time::Duration};

use chrono::TimeDelta;
use chrono_tz::Tz;
use governor::Quota;

use crate::{
    backoff::{BackoffStrategy, Exponential, Jitter},
    SeatWatchError,
};

/// Exponential backoff for infrastructure failures: 2 seconds doubling up to 5 minutes, with a
/// 10% jitter margin. Jitter never takes a retry below the 2 second base.
pub const DEFAULT_ERROR_BACKOFF: BackoffStrategy<Exponential> =
    BackoffStrategy::exponential(TimeDelta::seconds(2))
        .with_max(TimeDelta::minutes(5))
        .with_jitter(Jitter::Relative(0.1))
        .with_min(TimeDelta::seconds(2));

/// At most `max_jobs` dequeues per `per`, shared by every worker in the process.
///
/// Dequeues are spaced `per / max_jobs` apart with no burst, so any window of length `per`
/// admits at most `max_jobs` of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_jobs: u32,
    pub per: Duration,
}

impl RateLimit {
    pub(crate) fn quota(&self) -> Option<Quota> {
        let max_jobs = NonZeroU32::new(self.max_jobs)?;
        Quota::with_period(self.per / max_jobs.get())
    }
}

/// Tuning for a [`SeatWatch`](crate::SeatWatch) instance.
#[derive(Debug, Clone)]
pub struct SeatWatchConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    pub rate_limit: RateLimit,
    /// Delay between "no seats yet" attempts unless a job overrides it.
    pub retry_interval: TimeDelta,
    /// Consecutive infrastructure failures tolerated before a job is marked failed.
    pub error_budget: u32,
    pub error_backoff: BackoffStrategy<Exponential>,
    /// Must be shorter than `lease_timeout` so a lease never expires under a running probe.
    pub probe_timeout: Duration,
    pub heartbeat: Duration,
    /// A lease older than this is assumed to belong to a dead worker.
    pub lease_timeout: TimeDelta,
    pub reap_interval: Duration,
    pub default_priority: u16,
    pub event_capacity: usize,
    /// Civil time zone of the source, used to derive deadlines.
    pub time_zone: Tz,
}

impl Default for SeatWatchConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            rate_limit: RateLimit {
                max_jobs: 10,
                per: Duration::from_secs(1),
            },
            retry_interval: TimeDelta::minutes(3),
            error_budget: 3,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            probe_timeout: Duration::from_secs(30),
            heartbeat: Duration::from_secs(30),
            lease_timeout: TimeDelta::minutes(10),
            reap_interval: Duration::from_secs(60),
            default_priority: 1,
            event_capacity: 256,
            time_zone: chrono_tz::Asia::Seoul,
        }
    }
}

impl SeatWatchConfig {
    pub fn with_workers(self, workers: usize) -> Self {
        Self { workers, ..self }
    }

    pub fn with_rate_limit(self, max_jobs: u32, per: Duration) -> Self {
        Self {
            rate_limit: RateLimit { max_jobs, per },
            ..self
        }
    }

    pub fn with_retry_interval(self, retry_interval: TimeDelta) -> Self {
        Self {
            retry_interval,
            ..self
        }
    }

    pub fn with_error_budget(self, error_budget: u32) -> Self {
        Self {
            error_budget,
            ..self
        }
    }

    pub fn with_error_backoff(self, error_backoff: BackoffStrategy<Exponential>) -> Self {
        Self {
            error_backoff,
            ..self
        }
    }

    pub fn with_probe_timeout(self, probe_timeout: Duration) -> Self {
        Self {
            probe_timeout,
            ..self
        }
    }

    pub fn with_heartbeat(self, heartbeat: Duration) -> Self {
        Self { heartbeat, ..self }
    }

    pub fn with_lease_timeout(self, lease_timeout: TimeDelta) -> Self {
        Self {
            lease_timeout,
            ..self
        }
    }

    pub fn with_reap_interval(self, reap_interval: Duration) -> Self {
        Self {
            reap_interval,
            ..self
        }
    }

    pub fn with_default_priority(self, default_priority: u16) -> Self {
        Self {
            default_priority,
            ..self
        }
    }

    pub fn with_event_capacity(self, event_capacity: usize) -> Self {
        Self {
            event_capacity,
            ..self
        }
    }

    pub fn with_time_zone(self, time_zone: Tz) -> Self {
        Self { time_zone, ..self }
    }

    pub fn validate(&self) -> Result<(), SeatWatchError> {
        let invalid = |reason: &str| Err(SeatWatchError::InvalidConfig(reason.to_owned()));
        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.rate_limit.quota().is_none() {
            return invalid("rate limit must allow at least one job per non-zero period");
        }
        if self.retry_interval < TimeDelta::milliseconds(1) {
            return invalid("retry interval must be at least one millisecond");
        }
        if self.error_budget == 0 {
            return invalid("error budget must be at least 1");
        }
        if self.heartbeat.is_zero() || self.reap_interval.is_zero() {
            return invalid("heartbeat and reap interval must be non-zero");
        }
        let lease_timeout = self.lease_timeout.to_std().unwrap_or(Duration::ZERO);
        if lease_timeout.is_zero() {
            return invalid("lease timeout must be positive");
        }
        if self.probe_timeout.is_zero() {
            return invalid("probe timeout must be non-zero");
        }
        if self.probe_timeout >= lease_timeout {
            return invalid("probe timeout must be shorter than the lease timeout");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use crate::backoff::Strategy;
    use governor::{clock::FakeRelativeClock, RateLimiter};

    #[test]
    fn default_is_valid() {
        let config = SeatWatchConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.workers, 5);
        assert_eq!(config.retry_interval, TimeDelta::minutes(3));
        assert_eq!(config.error_budget, 3);
    }

    #[test]
    fn error_backoff_stays_above_base() {
        for _ in 0..100 {
            let first = DEFAULT_ERROR_BACKOFF.backoff(1);
            assert!(first >= TimeDelta::seconds(2), "{first}");
            assert!(first <= TimeDelta::milliseconds(2200), "{first}");
        }
        let capped = DEFAULT_ERROR_BACKOFF.backoff(20);
        assert!(capped <= TimeDelta::seconds(330), "{capped}");
    }

    #[test]
    fn invalid_settings_are_rejected() {
        for config in [
            SeatWatchConfig::default().with_workers(0),
            SeatWatchConfig::default().with_rate_limit(0, Duration::from_secs(1)),
            SeatWatchConfig::default().with_rate_limit(10, Duration::ZERO),
            SeatWatchConfig::default().with_retry_interval(TimeDelta::zero()),
            SeatWatchConfig::default().with_error_budget(0),
            SeatWatchConfig::default().with_lease_timeout(TimeDelta::seconds(10)),
        ] {
            assert_matches!(config.validate(), Err(SeatWatchError::InvalidConfig(_)));
        }
    }

    #[test]
    fn probe_must_finish_within_lease() {
        let config = SeatWatchConfig::default().with_lease_timeout(TimeDelta::seconds(30));
        for probe_timeout in [
            Duration::ZERO,
            Duration::from_secs(30),
            Duration::from_secs(31),
        ] {
            assert_matches!(
                config.clone().with_probe_timeout(probe_timeout).validate(),
                Err(SeatWatchError::InvalidConfig(_))
            );
        }

        assert!(config
            .with_probe_timeout(Duration::from_secs(29))
            .validate()
            .is_ok());
    }

    #[test]
    fn rate_limit_quota() {
        let quota = RateLimit {
            max_jobs: 10,
            per: Duration::from_secs(1),
        }
        .quota()
        .unwrap();

        assert_eq!(quota.burst_size().get(), 1);
        assert_eq!(quota.replenish_interval(), Duration::from_millis(100));
    }

    #[test]
    fn rate_limit_admits_at_most_max_jobs_per_window() {
        let rate_limit = SeatWatchConfig::default().rate_limit;
        let clock = FakeRelativeClock::default();
        let limiter = RateLimiter::direct_with_clock(rate_limit.quota().unwrap(), clock.clone());

        let step = Duration::from_millis(1);
        let mut admitted = Vec::new();
        let mut elapsed = Duration::ZERO;
        while elapsed < rate_limit.per * 3 {
            if limiter.check().is_ok() {
                admitted.push(elapsed);
            }
            clock.advance(step);
            elapsed += step;
        }

        for start in &admitted {
            let in_window = admitted
                .iter()
                .filter(|at| **at >= *start && **at < *start + rate_limit.per)
                .count();
            assert!(in_window <= rate_limit.max_jobs as usize, "{in_window} in one window");
        }
        assert_eq!(admitted.len(), 3 * rate_limit.max_jobs as usize);
    }
}
