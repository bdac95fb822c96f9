use chrono::{DateTime, TimeDelta, Utc};

use crate::{backend::Backend, route::RouteQuery, scheduler::Scheduler, SeatWatchError};

use super::JobId;

/// Describes a watch job to submit.
///
/// Unset options fall back to the scheduler's configuration: the deadline is derived from the
/// route, the retry interval and priority come from [`SeatWatchConfig`](crate::SeatWatchConfig),
/// and the first probe runs immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobBuilder {
    pub(crate) route: RouteQuery,
    pub(crate) priority: Option<u16>,
    pub(crate) schedule: Option<Schedule>,
    pub(crate) deadline: Option<DateTime<Utc>>,
    pub(crate) retry_interval: Option<TimeDelta>,
}

impl JobBuilder {
    pub fn new(route: RouteQuery) -> Self {
        Self {
            route,
            priority: None,
            schedule: None,
            deadline: None,
            retry_interval: None,
        }
    }

    /// Lower values are served first.
    pub fn with_priority(self, priority: u16) -> Self {
        Self {
            priority: Some(priority),
            ..self
        }
    }

    pub fn schedule_at(self, schedule_at: DateTime<Utc>) -> Self {
        Self {
            schedule: Some(Schedule::At(schedule_at)),
            ..self
        }
    }

    /// Delays the first probe by `schedule_in`, counted from submission.
    pub fn schedule_in(self, schedule_in: TimeDelta) -> Self {
        Self {
            schedule: Some(Schedule::In(schedule_in)),
            ..self
        }
    }

    /// Overrides the deadline derived from the route's latest target time.
    pub fn with_deadline(self, deadline: DateTime<Utc>) -> Self {
        Self {
            deadline: Some(deadline),
            ..self
        }
    }

    pub fn with_retry_interval(self, retry_interval: TimeDelta) -> Self {
        Self {
            retry_interval: Some(retry_interval),
            ..self
        }
    }

    pub async fn submit_to<B: Backend>(
        self,
        scheduler: &Scheduler<B>,
    ) -> Result<JobId, SeatWatchError> {
        scheduler.submit(self).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Schedule {
    At(DateTime<Utc>),
    In(TimeDelta),
}

impl Schedule {
    /// Resolves the first run time relative to `now`.
    pub(crate) fn resolve(self, now: DateTime<Utc>) -> Result<DateTime<Utc>, SeatWatchError> {
        match self {
            Self::At(at) => Ok(at),
            Self::In(delay) => now
                .checked_add_signed(delay)
                .ok_or(SeatWatchError::InvalidSchedule(delay)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, JobQueue, JobStore},
        job::JobStatus,
        SeatWatchConfig,
    };
    use assert_matches::assert_matches;
    use futures::StreamExt;

    #[tokio::test]
    async fn submit_with_overrides() {
        let backend = InMemoryBackend::new();
        let scheduler = Scheduler::new(backend.clone(), SeatWatchConfig::default());
        let deadline = Utc::now() + TimeDelta::minutes(30);

        let job_id = JobBuilder::new(RouteQuery::mock())
            .with_priority(0)
            .with_deadline(deadline)
            .with_retry_interval(TimeDelta::minutes(3))
            .submit_to(&scheduler)
            .await
            .unwrap();

        let record = scheduler.status(job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Waiting);
        assert_eq!(record.deadline, deadline);
        assert_eq!(record.max_attempts, 10);

        let mut stream = backend.subscribe_ready_jobs().await;
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.id, job_id);
        assert_eq!(delivery.priority, 0);
        assert_eq!(delivery.max_attempts, 10);
        assert_eq!(delivery.payload.plan.interval(), TimeDelta::minutes(3));
    }

    #[test]
    fn schedule_in_is_relative_to_submission() {
        let now = Utc::now();
        let builder = JobBuilder::new(RouteQuery::mock()).schedule_in(TimeDelta::hours(2));

        assert_eq!(
            builder.schedule.unwrap().resolve(now).unwrap(),
            now + TimeDelta::hours(2)
        );
    }

    #[tokio::test]
    async fn unrepresentable_delay_is_rejected() {
        let backend = InMemoryBackend::new();
        let scheduler = Scheduler::new(backend.clone(), SeatWatchConfig::default());

        let result = JobBuilder::new(RouteQuery::mock())
            .schedule_in(TimeDelta::milliseconds(i64::MAX))
            .submit_to(&scheduler)
            .await;

        assert_matches!(result, Err(SeatWatchError::InvalidSchedule(_)));
        assert!(backend.list(Default::default()).await.unwrap().is_empty());
    }
}
