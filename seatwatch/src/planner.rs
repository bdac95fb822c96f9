//! Works out how many probes fit before a deadline.
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::{BackoffStrategy, Constant};

/// The attempt budget for a job together with the fixed delay between "no seats yet" attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPlan {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl RetryPlan {
    pub fn interval(&self) -> TimeDelta {
        TimeDelta::milliseconds(i64::try_from(self.interval_ms).unwrap_or(i64::MAX))
    }

    /// The delay before each "no seats yet" retry. It does not grow with the attempt number.
    pub fn cadence(&self) -> BackoffStrategy<Constant> {
        BackoffStrategy::constant(self.interval())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Retry interval must be at least one millisecond, got {0}")]
    NonPositiveInterval(TimeDelta),
}

/// Computes `max(1, ceil((deadline - now) / interval))` attempts.
///
/// When `now` is at or past the deadline a single attempt is still granted so the job can be
/// recorded as having run out of time.
///
/// ```
/// # use seatwatch::planner::plan;
/// # use chrono::{TimeDelta, TimeZone, Utc};
/// let now = Utc.with_ymd_and_hms(2025, 11, 18, 9, 10, 0).unwrap();
/// let deadline = Utc.with_ymd_and_hms(2025, 11, 18, 9, 40, 0).unwrap();
///
/// let plan = plan(deadline, TimeDelta::minutes(3), now).unwrap();
/// assert_eq!(plan.max_attempts, 10);
/// ```
pub fn plan(
    deadline: DateTime<Utc>,
    interval: TimeDelta,
    now: DateTime<Utc>,
) -> Result<RetryPlan, PlanError> {
    let interval_ms = interval.num_milliseconds();
    if interval_ms <= 0 {
        return Err(PlanError::NonPositiveInterval(interval));
    }
    let remaining_ms = (deadline - now).num_milliseconds().max(0);
    let attempts = (remaining_ms / interval_ms + i64::from(remaining_ms % interval_ms != 0)).max(1);

    Ok(RetryPlan {
        max_attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        interval_ms: interval_ms.unsigned_abs(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backoff::Strategy;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 18, hour, minute, 0).unwrap()
    }

    #[test]
    fn thirty_minutes_at_three_minute_interval() {
        let plan = plan(at(18, 40), TimeDelta::minutes(3), at(18, 10)).unwrap();

        assert_eq!(plan.max_attempts, 10);
        assert_eq!(plan.interval(), TimeDelta::minutes(3));
        assert_eq!(plan.interval_ms, 180_000);
    }

    #[test]
    fn cadence_is_fixed_across_attempts() {
        let cadence = plan(at(18, 40), TimeDelta::minutes(3), at(18, 10))
            .unwrap()
            .cadence();

        for attempt in [1, 5, 10] {
            assert_eq!(cadence.backoff(attempt), TimeDelta::minutes(3));
        }
    }

    #[test]
    fn partial_interval_rounds_up() {
        let plan = plan(at(18, 41), TimeDelta::minutes(3), at(18, 10)).unwrap();

        assert_eq!(plan.max_attempts, 11);
    }

    #[test]
    fn matches_ceiling_formula() {
        let now = at(6, 0);
        for interval_minutes in [1, 2, 3, 7, 60] {
            for remaining_minutes in 1..600 {
                let interval = TimeDelta::minutes(interval_minutes);
                let deadline = now + TimeDelta::minutes(remaining_minutes);
                let expected = (remaining_minutes + interval_minutes - 1) / interval_minutes;

                let plan = plan(deadline, interval, now).unwrap();

                assert_eq!(i64::from(plan.max_attempts), expected.max(1));
            }
        }
    }

    #[test]
    fn deadline_reached_grants_single_attempt() {
        let interval = TimeDelta::minutes(3);

        assert_eq!(plan(at(18, 40), interval, at(18, 40)).unwrap().max_attempts, 1);
        assert_eq!(plan(at(18, 40), interval, at(23, 0)).unwrap().max_attempts, 1);
    }

    #[test]
    fn non_positive_interval_is_rejected() {
        assert_matches!(
            plan(at(18, 40), TimeDelta::zero(), at(18, 10)),
            Err(PlanError::NonPositiveInterval(_))
        );
        assert_matches!(
            plan(at(18, 40), TimeDelta::seconds(-5), at(18, 10)),
            Err(PlanError::NonPositiveInterval(_))
        );
    }
}
