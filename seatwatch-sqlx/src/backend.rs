use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use seatwatch::{
    backend::{BackendError, DeliveryStream, EnqueuableJob, JobQueue, JobStore},
    job::{
        query::JobQuery,
        state::{Transition, UpdateResult},
        JobId, JobRecord, JobStats,
    },
};
use sqlx::postgres::types::PgInterval;
use tokio::sync::mpsc;
use tracing::instrument;

use crate::{
    map_err,
    query::{ToQuery, JOB_COLUMNS, QUEUE_COLUMNS},
    stream::ReadyJobStream,
    types::{reason_text, signed, Job, JobStatus, QueueEntry, QueueState},
    SeatWatchPgBackend,
};

impl SeatWatchPgBackend {
    fn handle_update(result: sqlx::Result<u64>, job_id: JobId) -> Result<(), BackendError> {
        match result {
            Ok(0) => Err(BackendError::JobNotFound(job_id)),
            Ok(1) => Ok(()),
            Ok(_) => Err(BackendError::BadState),
            Err(error) => Err(map_err(error)),
        }
    }

    /// Like [`Self::handle_update`] for updates guarded by the entry's state: an existing entry
    /// in another state is left alone without error.
    async fn handle_guarded_update(
        &self,
        result: sqlx::Result<u64>,
        job_id: JobId,
    ) -> Result<(), BackendError> {
        match Self::handle_update(result, job_id) {
            Err(BackendError::JobNotFound(_)) => {
                if self.queue_entry_exists(job_id).await? {
                    Ok(())
                } else {
                    Err(BackendError::JobNotFound(job_id))
                }
            }
            result => result,
        }
    }

    async fn queue_entry_exists(&self, job_id: JobId) -> Result<bool, BackendError> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM seatwatch_queue WHERE id = $1)")
            .bind(i32::from(job_id))
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }

    pub(crate) async fn next_ready_scheduled_at(&self) -> sqlx::Result<Option<DateTime<Utc>>> {
        sqlx::query_scalar(
            r#"SELECT scheduled_at
            FROM seatwatch_queue
            WHERE state = 'ready'
            ORDER BY scheduled_at
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
    }

    pub(crate) async fn lease_next(
        &self,
        ready_by: DateTime<Utc>,
    ) -> sqlx::Result<Option<QueueEntry>> {
        let sql = format!(
            r#"UPDATE seatwatch_queue
            SET
                state = 'leased',
                leased_at = timezone('UTC'::text, now()),
                attempt = attempt + 1
            WHERE id IN (
                SELECT id FROM seatwatch_queue
                WHERE state = 'ready'
                AND scheduled_at <= $1
                ORDER BY priority, scheduled_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {QUEUE_COLUMNS}"#
        );
        sqlx::query_as(&sql)
            .bind(ready_by)
            .fetch_optional(&self.pool)
            .await
    }

    async fn insert_queue_entry(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        let payload = serde_json::to_value(&job.payload)?;
        let id: i32 = sqlx::query_scalar(
            r#"INSERT INTO seatwatch_queue (
                payload,
                max_attempts,
                priority,
                scheduled_at
            ) VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(payload)
        .bind(signed(job.max_attempts)?)
        .bind(i32::from(job.priority))
        .bind(job.scheduled_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(id.into())
    }

    /// Returns a leased entry to the ready state.
    async fn release(
        &self,
        id: JobId,
        next_scheduled_at: DateTime<Utc>,
        refund: bool,
        errored: bool,
    ) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            r#"UPDATE seatwatch_queue
            SET
                state = $2,
                scheduled_at = $3,
                leased_at = NULL,
                attempt = CASE WHEN $4 THEN attempt - 1 ELSE attempt END,
                error_count = CASE WHEN $5 THEN error_count + 1 ELSE 0 END
            WHERE id = $1 AND state = $6"#,
        )
        .bind(i32::from(id))
        .bind(QueueState::Ready)
        .bind(next_scheduled_at)
        .bind(refund)
        .bind(errored)
        .bind(QueueState::Leased)
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    async fn release_snoozed(&self, id: JobId, next_scheduled_at: DateTime<Utc>) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            r#"UPDATE seatwatch_queue
            SET
                state = $2,
                scheduled_at = $3,
                leased_at = NULL,
                attempt = attempt - 1
            WHERE id = $1 AND state = $4"#,
        )
        .bind(i32::from(id))
        .bind(QueueState::Ready)
        .bind(next_scheduled_at)
        .bind(QueueState::Leased)
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    async fn insert_record(
        &self,
        record: &JobRecord,
        route: serde_json::Value,
    ) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            r#"INSERT INTO seatwatch_jobs (
                id,
                route,
                status,
                retry_count,
                max_attempts,
                deadline,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(i32::from(record.id))
        .bind(route)
        .bind(JobStatus::from(record.status))
        .bind(record.retry_count as i32)
        .bind(record.max_attempts as i32)
        .bind(record.deadline)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    async fn apply_transition(
        &self,
        id: JobId,
        transition: Transition,
    ) -> Result<UpdateResult, BackendError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        let sql = format!("SELECT {JOB_COLUMNS} FROM seatwatch_jobs WHERE id = $1 FOR UPDATE");
        let current: JobRecord = sqlx::query_as::<_, Job>(&sql)
            .bind(i32::from(id))
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_err)?
            .ok_or(BackendError::JobNotFound(id))?
            .try_into()?;

        let updated = match current.transitioned(transition, Utc::now()) {
            UpdateResult::Applied(record) => record,
            unchanged => return Ok(unchanged),
        };

        let sql = format!(
            r#"UPDATE seatwatch_jobs
            SET
                status = $2,
                retry_count = $3,
                last_outcome = $4,
                completion_reason = $5,
                error = $6,
                updated_at = $7,
                completed_at = $8
            WHERE id = $1
            RETURNING {JOB_COLUMNS}"#
        );
        let stored: Job = sqlx::query_as(&sql)
            .bind(i32::from(id))
            .bind(JobStatus::from(updated.status))
            .bind(signed(updated.retry_count)?)
            .bind(updated.last_outcome.as_ref().map(serde_json::to_value).transpose()?)
            .bind(updated.completion_reason.map(reason_text).transpose()?)
            .bind(updated.error)
            .bind(updated.updated_at)
            .bind(updated.completed_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_err)?;

        tx.commit().await.map_err(map_err)?;
        Ok(UpdateResult::Applied(stored.try_into()?))
    }
}

#[async_trait]
impl JobQueue for SeatWatchPgBackend {
    #[instrument(skip(self))]
    async fn subscribe_ready_jobs(&self) -> DeliveryStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.write().await.push(sender);

        let mut stream = ReadyJobStream {
            receiver,
            backend: self.clone(),
        };
        Box::pin(stream! {
            loop {
                yield stream.next().await;
            }
        })
    }

    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        self.insert_queue_entry(job).await
    }

    async fn mark_retryable(
        &self,
        id: JobId,
        next_scheduled_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let result = self.release(id, next_scheduled_at, false, false).await;
        self.handle_guarded_update(result, id).await
    }

    async fn mark_errored(
        &self,
        id: JobId,
        next_scheduled_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let result = self.release(id, next_scheduled_at, true, true).await;
        self.handle_guarded_update(result, id).await
    }

    async fn mark_snoozed(
        &self,
        id: JobId,
        next_scheduled_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let result = self.release_snoozed(id, next_scheduled_at).await;
        self.handle_guarded_update(result, id).await
    }

    async fn mark_done(&self, id: JobId) -> Result<(), BackendError> {
        let result = sqlx::query(
            r#"UPDATE seatwatch_queue
            SET
                state = $2,
                leased_at = NULL
            WHERE id = $1"#,
        )
        .bind(i32::from(id))
        .bind(QueueState::Done)
        .execute(&self.pool)
        .await
        .map(|result| result.rows_affected());
        Self::handle_update(result, id)
    }

    async fn cancel(&self, id: JobId) -> Result<(), BackendError> {
        let result = sqlx::query(
            r#"UPDATE seatwatch_queue
            SET
                state = $2,
                leased_at = NULL
            WHERE id = $1 AND state IN ('ready', 'leased')"#,
        )
        .bind(i32::from(id))
        .bind(QueueState::Cancelled)
        .execute(&self.pool)
        .await
        .map(|result| result.rows_affected());
        self.handle_guarded_update(result, id).await
    }

    async fn requeue_expired_leases(&self, lease_timeout: TimeDelta) -> Result<u64, BackendError> {
        let lease_timeout = PgInterval::try_from(lease_timeout).map_err(|error| {
            tracing::error!(?error, "Lease timeout {lease_timeout} is not a valid interval");
            BackendError::BadState
        })?;
        sqlx::query(
            r#"UPDATE seatwatch_queue
            SET
                state = 'ready',
                scheduled_at = timezone('UTC'::text, now()),
                leased_at = NULL,
                attempt = attempt - 1
            WHERE state = 'leased' AND leased_at < timezone('UTC'::text, now()) - $1"#,
        )
        .bind(lease_timeout)
        .execute(&self.pool)
        .await
        .map(|result| result.rows_affected())
        .map_err(map_err)
    }
}

#[async_trait]
impl JobStore for SeatWatchPgBackend {
    async fn insert(&self, record: JobRecord) -> Result<(), BackendError> {
        let route = serde_json::to_value(&record.route)?;
        match self.insert_record(&record, route).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                Err(BackendError::AlreadyExists(record.id))
            }
            Err(error) => Err(map_err(error)),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, BackendError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM seatwatch_jobs WHERE id = $1");
        sqlx::query_as::<_, Job>(&sql)
            .bind(i32::from(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .map(TryFrom::try_from)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn update(
        &self,
        id: JobId,
        transition: Transition,
    ) -> Result<UpdateResult, BackendError> {
        self.apply_transition(id, transition).await
    }

    async fn list(&self, query: JobQuery) -> Result<Vec<JobRecord>, BackendError> {
        query
            .query()
            .build_query_as::<Job>()
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(TryFrom::try_from)
            .collect()
    }

    async fn stats(&self) -> Result<JobStats, BackendError> {
        let counts: Vec<(JobStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM seatwatch_jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        let (found_seats, total_checks, total_duration_ms): (i64, i64, i64) = sqlx::query_as(
            r#"SELECT
                COUNT(*) FILTER (WHERE COALESCE((last_outcome->>'foundSeats')::boolean, false)),
                COALESCE(SUM(retry_count + 1), 0)::BIGINT,
                COALESCE(
                    SUM(GREATEST(EXTRACT(EPOCH FROM (completed_at - created_at)) * 1000, 0)),
                    0
                )::BIGINT
            FROM seatwatch_jobs
            WHERE status IN ('completed', 'failed')"#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;

        let mut stats = counts
            .into_iter()
            .fold(JobStats::default(), |mut stats, (status, count)| {
                stats.add(status.into(), count.max(0) as u64);
                stats
            });
        stats.found_seats = found_seats.max(0) as u64;
        stats.total_checks = total_checks.max(0) as u64;
        stats.total_duration_ms = total_duration_ms.max(0) as u64;
        Ok(stats)
    }
}
