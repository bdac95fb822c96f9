//! Test suite for ensuring a correct implementation of a backend.
use std::time::Duration;

use chrono::TimeDelta;
use futures::StreamExt;

use crate::{
    job::{state::Transition, CompletionReason, JobStatus},
    planner::RetryPlan,
    route::{ProbeOutcome, RouteQuery, TimeSlotResult},
};

use super::*;

const WAIT: Duration = Duration::from_millis(500);

impl EnqueuableJob {
    pub fn mock_job() -> Self {
        let route = RouteQuery::new("4100", "3600", "11", "18", ["18:40", "19:40"])
            .expect("valid route");
        Self {
            payload: JobPayload {
                route,
                deadline: Utc::now() + TimeDelta::hours(1),
                plan: RetryPlan {
                    max_attempts: 5,
                    interval_ms: 10,
                },
            },
            priority: 1,
            scheduled_at: Utc::now(),
            max_attempts: 5,
        }
    }

    pub fn with_priority(self, priority: u16) -> Self {
        Self { priority, ..self }
    }

    pub fn with_scheduled_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at,
            ..self
        }
    }
}

fn record_for(id: JobId, job: &EnqueuableJob, created_at: DateTime<Utc>) -> JobRecord {
    JobRecord::waiting(
        id,
        job.payload.route.clone(),
        job.payload.deadline,
        job.max_attempts,
        created_at,
    )
}

fn no_seats(route: &RouteQuery) -> ProbeOutcome {
    ProbeOutcome::from_slots(route, vec![], Utc::now(), 5)
}

fn seats(route: &RouteQuery) -> ProbeOutcome {
    ProbeOutcome::from_slots(
        route,
        vec![TimeSlotResult {
            time: "19:40".to_owned(),
            remaining_seats_text: "2".to_owned(),
            status_text: "available".to_owned(),
            has_seats: true,
        }],
        Utc::now(),
        5,
    )
}

async fn next_delivery(stream: &mut DeliveryStream) -> Option<Delivery> {
    match tokio::time::timeout(WAIT, stream.next()).await {
        Ok(Some(Ok(delivery))) => Some(delivery),
        Ok(Some(Err(error))) => panic!("Stream errored: {error}"),
        Ok(None) => panic!("Stream ended"),
        Err(_) => None,
    }
}

async fn insert_job(backend: &impl Backend, job: EnqueuableJob) -> JobId {
    let record = job.clone();
    let id = backend.enqueue(job).await.unwrap();
    backend
        .insert(record_for(id, &record, Utc::now()))
        .await
        .unwrap();
    id
}

/// Create test suite for a seatwatch backend.
///
/// Backend implementors should include this as part of their test suites.
///
/// # Example
///
/// ```ignore
/// use seatwatch::test_suite;
/// use seatwatch::backend::memory::InMemoryBackend;
/// test_suite!(for: InMemoryBackend::new());
/// ```
///
/// A different async test attribute, and an additional attribute applied to every test, can be
/// configured. For example when using `sqlx::test`:
///
/// ```ignore
/// use seatwatch::test_suite;
/// test_suite!(
///     attr: sqlx::test,
///     extra: ignore = "requires a postgres database",
///     args: (pool: PgPool),
///     backend: BackendImplementation::from_pool(pool).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), backend: $backend);
    };
    (attr: $attr:meta, $(extra: $extra:meta,)? args: $args:tt, backend: $backend:expr) => {
        #[$attr]
        $(#[$extra])?
        async fn subscribe_ready_jobs $args {
          let backend = $backend;
          $crate::backend::testing::subscribe_ready_jobs(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn subscribe_ready_jobs_enqueuing_wakes_subscriber $args {
          let backend = $backend;
          $crate::backend::testing::subscribe_ready_jobs_enqueuing_wakes_subscriber(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn subscribe_ready_jobs_streams_jobs_by_priority $args {
          let backend = $backend;
          $crate::backend::testing::subscribe_ready_jobs_streams_jobs_by_priority(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn subscribe_ready_jobs_only_one_stream_receives_job $args {
          let backend = $backend;
          $crate::backend::testing::subscribe_ready_jobs_only_one_stream_receives_job(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn subscribe_ready_jobs_waits_for_scheduled_at $args {
          let backend = $backend;
          $crate::backend::testing::subscribe_ready_jobs_waits_for_scheduled_at(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn mark_retryable_redelivers_with_next_attempt $args {
          let backend = $backend;
          $crate::backend::testing::mark_retryable_redelivers_with_next_attempt(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn mark_errored_refunds_attempt $args {
          let backend = $backend;
          $crate::backend::testing::mark_errored_refunds_attempt(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn mark_snoozed_refunds_attempt $args {
          let backend = $backend;
          $crate::backend::testing::mark_snoozed_refunds_attempt(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn mark_done_is_never_redelivered $args {
          let backend = $backend;
          $crate::backend::testing::mark_done_is_never_redelivered(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn mark_done_not_found $args {
          let backend = $backend;
          $crate::backend::testing::mark_done_not_found(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn cancel_is_never_redelivered $args {
          let backend = $backend;
          $crate::backend::testing::cancel_is_never_redelivered(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn cancel_while_leased_is_not_resurrected $args {
          let backend = $backend;
          $crate::backend::testing::cancel_while_leased_is_not_resurrected(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn requeue_expired_leases $args {
          let backend = $backend;
          $crate::backend::testing::requeue_expired_leases(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn insert_and_get $args {
          let backend = $backend;
          $crate::backend::testing::insert_and_get(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn insert_duplicate $args {
          let backend = $backend;
          $crate::backend::testing::insert_duplicate(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn update_applies_transitions $args {
          let backend = $backend;
          $crate::backend::testing::update_applies_transitions(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn update_terminal_is_unchanged $args {
          let backend = $backend;
          $crate::backend::testing::update_terminal_is_unchanged(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn update_not_found $args {
          let backend = $backend;
          $crate::backend::testing::update_not_found(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn list_newest_first_with_pagination $args {
          let backend = $backend;
          $crate::backend::testing::list_newest_first_with_pagination(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn list_filters_by_status $args {
          let backend = $backend;
          $crate::backend::testing::list_filters_by_status(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn stats_counts_statuses $args {
          let backend = $backend;
          $crate::backend::testing::stats_counts_statuses(backend).await;
        }
        #[$attr]
        $(#[$extra])?
        async fn stats_summarise_finished_jobs $args {
          let backend = $backend;
          $crate::backend::testing::stats_summarise_finished_jobs(backend).await;
        }
    };
}

#[doc(hidden)]
pub async fn subscribe_ready_jobs(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let mut stream = backend.subscribe_ready_jobs().await;

    let delivery = next_delivery(&mut stream).await.expect("job delivered");

    assert_eq!(delivery.id, id);
    assert_eq!(delivery.attempt, 1);
    assert_eq!(delivery.max_attempts, 5);
    assert_eq!(delivery.error_count, 0);
    assert_eq!(delivery.payload.route, EnqueuableJob::mock_job().payload.route);
    assert_eq!(delivery.payload.plan.max_attempts, 5);
}

#[doc(hidden)]
pub async fn subscribe_ready_jobs_enqueuing_wakes_subscriber(backend: impl Backend) {
    let mut stream = backend.subscribe_ready_jobs().await;
    let handle = tokio::spawn(async move { next_delivery(&mut stream).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let delivery = handle.await.unwrap().expect("woken by enqueue");
    assert_eq!(delivery.id, id);
}

#[doc(hidden)]
pub async fn subscribe_ready_jobs_streams_jobs_by_priority(backend: impl Backend) {
    let now = Utc::now();
    let low = backend
        .enqueue(EnqueuableJob::mock_job().with_priority(5).with_scheduled_at(now))
        .await
        .unwrap();
    let high = backend
        .enqueue(EnqueuableJob::mock_job().with_priority(0).with_scheduled_at(now))
        .await
        .unwrap();
    let mut stream = backend.subscribe_ready_jobs().await;

    assert_eq!(next_delivery(&mut stream).await.map(|d| d.id), Some(high));
    assert_eq!(next_delivery(&mut stream).await.map(|d| d.id), Some(low));
}

#[doc(hidden)]
pub async fn subscribe_ready_jobs_only_one_stream_receives_job(backend: impl Backend) {
    let mut first = backend.subscribe_ready_jobs().await;
    let mut second = backend.subscribe_ready_jobs().await;
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let (a, b) = tokio::join!(next_delivery(&mut first), next_delivery(&mut second));

    assert!(a.is_some() != b.is_some(), "exactly one stream should lease the job");
}

#[doc(hidden)]
pub async fn subscribe_ready_jobs_waits_for_scheduled_at(backend: impl Backend) {
    backend
        .enqueue(EnqueuableJob::mock_job().with_scheduled_at(Utc::now() + TimeDelta::hours(1)))
        .await
        .unwrap();
    let mut stream = backend.subscribe_ready_jobs().await;

    assert_eq!(next_delivery(&mut stream).await, None);
}

#[doc(hidden)]
pub async fn mark_retryable_redelivers_with_next_attempt(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let mut stream = backend.subscribe_ready_jobs().await;
    let first = next_delivery(&mut stream).await.expect("first delivery");

    backend
        .mark_retryable(id, Utc::now() + TimeDelta::milliseconds(50))
        .await
        .unwrap();

    let second = next_delivery(&mut stream).await.expect("redelivered");
    assert_eq!(second.id, first.id);
    assert_eq!(second.attempt, 2);
    assert_eq!(second.error_count, 0);
}

#[doc(hidden)]
pub async fn mark_errored_refunds_attempt(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let mut stream = backend.subscribe_ready_jobs().await;
    next_delivery(&mut stream).await.expect("first delivery");

    backend.mark_errored(id, Utc::now()).await.unwrap();
    let second = next_delivery(&mut stream).await.expect("redelivered");
    backend.mark_errored(id, Utc::now()).await.unwrap();
    let third = next_delivery(&mut stream).await.expect("redelivered");

    assert_eq!(second.attempt, 1);
    assert_eq!(second.error_count, 1);
    assert_eq!(third.attempt, 1);
    assert_eq!(third.error_count, 2);

    backend.mark_retryable(id, Utc::now()).await.unwrap();
    let fourth = next_delivery(&mut stream).await.expect("redelivered");
    assert_eq!(fourth.attempt, 2);
    assert_eq!(fourth.error_count, 0);
}

#[doc(hidden)]
pub async fn mark_snoozed_refunds_attempt(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let mut stream = backend.subscribe_ready_jobs().await;
    next_delivery(&mut stream).await.expect("first delivery");

    backend.mark_snoozed(id, Utc::now()).await.unwrap();

    let second = next_delivery(&mut stream).await.expect("redelivered");
    assert_eq!(second.attempt, 1);
    assert_eq!(second.error_count, 0);
}

#[doc(hidden)]
pub async fn mark_done_is_never_redelivered(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let mut stream = backend.subscribe_ready_jobs().await;
    next_delivery(&mut stream).await.expect("first delivery");

    backend.mark_done(id).await.unwrap();
    backend.mark_retryable(id, Utc::now()).await.unwrap();

    assert_eq!(next_delivery(&mut stream).await, None);
}

#[doc(hidden)]
pub async fn mark_done_not_found(backend: impl Backend) {
    let id = JobId::from(i32::MAX);

    assert!(matches!(
        backend.mark_done(id).await,
        Err(BackendError::JobNotFound(not_found)) if not_found == id
    ));
    assert!(matches!(
        backend.mark_retryable(id, Utc::now()).await,
        Err(BackendError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn cancel_is_never_redelivered(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    backend.cancel(id).await.unwrap();
    let mut stream = backend.subscribe_ready_jobs().await;

    assert_eq!(next_delivery(&mut stream).await, None);
}

#[doc(hidden)]
pub async fn cancel_while_leased_is_not_resurrected(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let mut stream = backend.subscribe_ready_jobs().await;
    next_delivery(&mut stream).await.expect("first delivery");

    backend.cancel(id).await.unwrap();
    backend.mark_retryable(id, Utc::now()).await.unwrap();
    backend.mark_errored(id, Utc::now()).await.unwrap();

    assert_eq!(next_delivery(&mut stream).await, None);
}

#[doc(hidden)]
pub async fn requeue_expired_leases(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let mut stream = backend.subscribe_ready_jobs().await;
    next_delivery(&mut stream).await.expect("first delivery");

    let none_expired = backend
        .requeue_expired_leases(TimeDelta::hours(1))
        .await
        .unwrap();
    assert_eq!(none_expired, 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let expired = backend
        .requeue_expired_leases(TimeDelta::milliseconds(5))
        .await
        .unwrap();
    assert_eq!(expired, 1);

    let redelivered = next_delivery(&mut stream).await.expect("redelivered");
    assert_eq!(redelivered.id, id);
    assert_eq!(redelivered.attempt, 1);
}

#[doc(hidden)]
pub async fn insert_and_get(backend: impl Backend) {
    let job = EnqueuableJob::mock_job();
    let id = insert_job(&backend, job.clone()).await;

    let record = backend.get(id).await.unwrap().expect("record stored");

    assert_eq!(record.id, id);
    assert_eq!(record.status, JobStatus::Waiting);
    assert_eq!(record.route, job.payload.route);
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.completed_at, None);
    assert_eq!(backend.get(JobId::from(i32::MAX)).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn insert_duplicate(backend: impl Backend) {
    let job = EnqueuableJob::mock_job();
    let id = insert_job(&backend, job.clone()).await;

    let result = backend.insert(record_for(id, &job, Utc::now())).await;

    assert!(matches!(result, Err(BackendError::AlreadyExists(duplicate)) if duplicate == id));
}

#[doc(hidden)]
pub async fn update_applies_transitions(backend: impl Backend) {
    let job = EnqueuableJob::mock_job();
    let route = job.payload.route.clone();
    let id = insert_job(&backend, job).await;

    let active = backend.update(id, Transition::Activate).await.unwrap();
    assert!(active.is_applied());
    assert_eq!(active.record().status, JobStatus::Active);

    let waiting = backend
        .update(
            id,
            Transition::Reschedule {
                outcome: no_seats(&route),
            },
        )
        .await
        .unwrap();
    assert!(waiting.is_applied());
    assert_eq!(waiting.record().status, JobStatus::Waiting);
    assert_eq!(waiting.record().retry_count, 1);

    backend.update(id, Transition::Activate).await.unwrap();
    let completed = backend
        .update(
            id,
            Transition::Complete {
                outcome: Some(seats(&route)),
                reason: CompletionReason::SeatsFound,
            },
        )
        .await
        .unwrap()
        .into_record();

    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(completed.retry_count, 1);
    assert!(completed.found_seats());
    assert!(completed.completed_at.is_some());
    assert_eq!(
        completed.completion_reason,
        Some(CompletionReason::SeatsFound)
    );
    assert_eq!(backend.get(id).await.unwrap(), Some(completed));
}

#[doc(hidden)]
pub async fn update_terminal_is_unchanged(backend: impl Backend) {
    let id = insert_job(&backend, EnqueuableJob::mock_job()).await;

    let cancelled = backend.update(id, Transition::Cancel).await.unwrap();
    assert!(cancelled.is_applied());
    let cancelled = cancelled.into_record();

    let replay = backend.update(id, Transition::Cancel).await.unwrap();
    let activate = backend.update(id, Transition::Activate).await.unwrap();

    assert_eq!(replay, UpdateResult::Unchanged(cancelled.clone()));
    assert_eq!(activate, UpdateResult::Unchanged(cancelled.clone()));
    assert_eq!(backend.get(id).await.unwrap(), Some(cancelled));
}

#[doc(hidden)]
pub async fn update_not_found(backend: impl Backend) {
    let id = JobId::from(i32::MAX);

    assert!(matches!(
        backend.update(id, Transition::Activate).await,
        Err(BackendError::JobNotFound(not_found)) if not_found == id
    ));
}

#[doc(hidden)]
pub async fn list_newest_first_with_pagination(backend: impl Backend) {
    let now = Utc::now();
    let mut ids = Vec::new();
    for minutes in 0..5 {
        let job = EnqueuableJob::mock_job();
        let id = backend.enqueue(job.clone()).await.unwrap();
        backend
            .insert(record_for(id, &job, now + TimeDelta::minutes(minutes)))
            .await
            .unwrap();
        ids.push(id);
    }
    ids.reverse();

    let first_page: Vec<_> = backend
        .list(JobQuery::all().with_limit(2))
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.id)
        .collect();
    let second_page: Vec<_> = backend
        .list(JobQuery::all().with_limit(2).with_offset(2))
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.id)
        .collect();

    assert_eq!(first_page, ids[0..2]);
    assert_eq!(second_page, ids[2..4]);
}

#[doc(hidden)]
pub async fn list_filters_by_status(backend: impl Backend) {
    let waiting = insert_job(&backend, EnqueuableJob::mock_job()).await;
    let cancelled = insert_job(&backend, EnqueuableJob::mock_job()).await;
    backend.update(cancelled, Transition::Cancel).await.unwrap();

    let listed: Vec<_> = backend
        .list(JobQuery::all().with_status(JobStatus::Cancelled))
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.id)
        .collect();

    assert_eq!(listed, vec![cancelled]);
    assert!(!listed.contains(&waiting));
}

#[doc(hidden)]
pub async fn stats_counts_statuses(backend: impl Backend) {
    insert_job(&backend, EnqueuableJob::mock_job()).await;
    insert_job(&backend, EnqueuableJob::mock_job()).await;
    let active = insert_job(&backend, EnqueuableJob::mock_job()).await;
    backend.update(active, Transition::Activate).await.unwrap();

    let stats = backend.stats().await.unwrap();

    assert_eq!(stats.waiting, 2);
    assert_eq!(stats.active, 1);
    assert_eq!(stats.total(), 3);
    assert_eq!(stats.finished(), 0);
    assert_eq!(stats.total_checks, 0);
}

#[doc(hidden)]
pub async fn stats_summarise_finished_jobs(backend: impl Backend) {
    let route = EnqueuableJob::mock_job().payload.route;
    let found = insert_job(&backend, EnqueuableJob::mock_job()).await;
    for _ in 0..2 {
        backend.update(found, Transition::Activate).await.unwrap();
        backend
            .update(
                found,
                Transition::Reschedule {
                    outcome: no_seats(&route),
                },
            )
            .await
            .unwrap();
    }
    backend.update(found, Transition::Activate).await.unwrap();
    backend
        .update(
            found,
            Transition::Complete {
                outcome: Some(seats(&route)),
                reason: CompletionReason::SeatsFound,
            },
        )
        .await
        .unwrap();
    let failed = insert_job(&backend, EnqueuableJob::mock_job()).await;
    backend.update(failed, Transition::Activate).await.unwrap();
    backend
        .update(
            failed,
            Transition::Fail {
                error: "transport".to_owned(),
                outcome: None,
            },
        )
        .await
        .unwrap();
    let cancelled = insert_job(&backend, EnqueuableJob::mock_job()).await;
    backend.update(cancelled, Transition::Cancel).await.unwrap();

    let stats = backend.stats().await.unwrap();

    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.found_seats, 1);
    assert_eq!(stats.total_checks, 4);
    assert_eq!(stats.found_seats_rate(), 50.0);
    assert_eq!(stats.avg_checks_per_job(), 2.0);
    assert!(stats.total_duration_ms < 60_000);
}
