//! The submission interface: submit, cancel, inspect and watch jobs.
use std::sync::Arc;

use chrono::Utc;
use futures::Stream;
use tracing::instrument;

use crate::{
    backend::{Backend, BackendError, EnqueuableJob, JobPayload},
    events::{EventNotifier, JobEvent},
    job::{
        builder::JobBuilder,
        query::JobQuery,
        state::{Transition, UpdateResult},
        JobId, JobRecord, JobStats,
    },
    planner, SeatWatchConfig, SeatWatchError,
};

/// A cheaply cloneable handle for submitting and managing jobs on a backend.
#[derive(Clone)]
pub struct Scheduler<B: Backend> {
    backend: B,
    events: EventNotifier,
    config: Arc<SeatWatchConfig>,
}

impl<B> Scheduler<B>
where
    B: Backend,
{
    pub fn new(backend: B, config: SeatWatchConfig) -> Self {
        Self::with_shared_config(backend, Arc::new(config))
    }

    pub(crate) fn with_shared_config(backend: B, config: Arc<SeatWatchConfig>) -> Self {
        let events = EventNotifier::new(config.event_capacity, config.heartbeat);
        Self {
            backend,
            events,
            config,
        }
    }

    pub(crate) fn events(&self) -> &EventNotifier {
        &self.events
    }

    /// Validates and plans the job, enqueues its first attempt and records it as waiting.
    ///
    /// Invalid routes and unplannable deadlines are rejected here and never enqueued.
    #[instrument(skip_all, fields(job_id))]
    pub async fn submit(&self, job: JobBuilder) -> Result<JobId, SeatWatchError> {
        let now = Utc::now();
        let route = job.route.validated()?;
        let deadline = match job.deadline {
            Some(deadline) => deadline,
            None => route.deadline(self.config.time_zone, now)?,
        };
        let plan = planner::plan(
            deadline,
            job.retry_interval.unwrap_or(self.config.retry_interval),
            now,
        )?;
        let scheduled_at = match job.schedule {
            Some(schedule) => schedule.resolve(now)?,
            None => now,
        };

        let job_id = self
            .backend
            .enqueue(EnqueuableJob {
                payload: JobPayload {
                    route: route.clone(),
                    deadline,
                    plan,
                },
                priority: job.priority.unwrap_or(self.config.default_priority),
                scheduled_at,
                max_attempts: plan.max_attempts,
            })
            .await?;
        tracing::Span::current().record("job_id", tracing::field::display(job_id));

        let record = JobRecord::waiting(job_id, route, deadline, plan.max_attempts, now);
        if let Err(error) = self.backend.insert(record.clone()).await {
            tracing::error!(?error, %job_id, "Failed to record job {job_id}, withdrawing it");
            let _ = self.backend.cancel(job_id).await.inspect_err(|err| {
                tracing::error!(?err, %job_id, "Failed to withdraw job {job_id}: {err}")
            });
            return Err(error.into());
        }

        tracing::info!(
            %job_id,
            %deadline,
            max_attempts = plan.max_attempts,
            interval_ms = plan.interval_ms,
            "Submitted job {job_id}"
        );
        self.events.publish(&record);
        Ok(job_id)
    }

    /// Cancels a job that has not finished yet.
    ///
    /// A probe already in flight runs to completion but its result is discarded. Cancelling a
    /// finished job returns it unchanged.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: JobId) -> Result<JobRecord, SeatWatchError> {
        match self
            .backend
            .update(job_id, Transition::Cancel)
            .await
            .map_err(|error| not_found(job_id, error))?
        {
            UpdateResult::Applied(record) => {
                let _ = self.backend.cancel(job_id).await.inspect_err(|err| {
                    tracing::warn!(?err, %job_id, "Failed to withdraw queue entry for {job_id}")
                });
                tracing::info!(%job_id, "Cancelled job {job_id}");
                self.events.publish(&record);
                Ok(record)
            }
            UpdateResult::Unchanged(record) => Ok(record),
        }
    }

    pub async fn status(&self, job_id: JobId) -> Result<JobRecord, SeatWatchError> {
        self.backend
            .get(job_id)
            .await?
            .ok_or(SeatWatchError::JobNotFound(job_id))
    }

    pub async fn list(&self, query: JobQuery) -> Result<Vec<JobRecord>, SeatWatchError> {
        Ok(self.backend.list(query).await?)
    }

    pub async fn stats(&self) -> Result<JobStats, SeatWatchError> {
        Ok(self.backend.stats().await?)
    }

    /// Job updates plus heartbeats, see [`EventNotifier::subscribe`].
    pub fn subscribe(&self) -> impl Stream<Item = JobEvent> + Send + 'static {
        self.events.subscribe()
    }
}

fn not_found(job_id: JobId, error: BackendError) -> SeatWatchError {
    match error {
        BackendError::JobNotFound(_) => SeatWatchError::JobNotFound(job_id),
        error => error.into(),
    }
}
