use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{instrument, Instrument};

use crate::{
    backend::{Backend, BackendError, Delivery},
    backoff::Strategy,
    cancellation::{CancellationGate, Gate},
    events::EventNotifier,
    notify::{NotificationSink, SeatAlert},
    probe::{Probe, ProbeError},
    route::{ProbeOutcome, RouteQuery},
    SeatWatchConfig,
};

use super::{
    state::{Transition, UpdateResult},
    CompletionReason, JobId,
};

/// How long a delivery is put back when its record cannot be read or written.
const SNOOZE: TimeDelta = TimeDelta::seconds(1);

enum Attempt {
    Outcome(ProbeOutcome),
    Failed {
        error: ProbeError,
        outcome: Option<ProbeOutcome>,
    },
}

pub(crate) struct JobRunner<B: Backend> {
    backend: B,
    gate: CancellationGate<B>,
    probe: Arc<dyn Probe>,
    sink: Arc<dyn NotificationSink>,
    events: EventNotifier,
    config: Arc<SeatWatchConfig>,
}

impl<B> JobRunner<B>
where
    B: Backend,
{
    pub(crate) fn new(
        backend: B,
        probe: Arc<dyn Probe>,
        sink: Arc<dyn NotificationSink>,
        events: EventNotifier,
        config: Arc<SeatWatchConfig>,
    ) -> Self {
        Self {
            gate: CancellationGate::new(backend.clone()),
            backend,
            probe,
            sink,
            events,
            config,
        }
    }

    #[instrument(skip(self, delivery), fields(job_id = %delivery.id, attempt = delivery.attempt))]
    pub async fn execute(&self, delivery: Delivery) {
        let job_id = delivery.id;

        match self.gate.check(job_id).await {
            Ok(Gate::Open(_)) => {}
            Ok(Gate::Closed(record)) => {
                tracing::debug!(%job_id, "Job {job_id} is {}, dropping delivery", record.status);
                return self.acknowledge(job_id).await;
            }
            Ok(Gate::Missing) => return self.handle_missing_record(&delivery).await,
            Err(error) => {
                tracing::error!(?error, %job_id, "Failed to check job {job_id}: {error}");
                return self.snooze(job_id).await;
            }
        }

        match self.transition(job_id, Transition::Activate).await {
            Ok(true) => {}
            Ok(false) => return self.acknowledge(job_id).await,
            Err(_) => return self.snooze(job_id).await,
        }

        if Utc::now() >= delivery.payload.deadline {
            tracing::debug!(%job_id, "Deadline for job {job_id} has passed");
            let transition = Transition::Complete {
                outcome: None,
                reason: CompletionReason::DeadlineExceeded,
            };
            return self.finish(job_id, transition).await;
        }

        tracing::debug!(%job_id, "Probing for job {job_id}");
        let attempt = self.run_probe(&delivery.payload.route).await;
        let now = Utc::now();
        match attempt {
            Attempt::Outcome(outcome) if outcome.found_seats => {
                self.handle_seats_found(&delivery, outcome).await
            }
            Attempt::Outcome(outcome) => self.handle_no_seats(&delivery, outcome, now).await,
            Attempt::Failed { error, outcome } => {
                self.handle_error(&delivery, error, outcome, now).await
            }
        }
    }

    async fn run_probe(&self, route: &RouteQuery) -> Attempt {
        let probe = self.probe.clone();
        let route = route.clone();
        let timeout = self.config.probe_timeout;
        let handle = tokio::spawn(
            async move {
                tokio::time::timeout(timeout, probe.probe(&route))
                    .await
                    .unwrap_or_else(|_| Err(ProbeError::Timeout(timeout)))
            }
            .in_current_span(),
        );

        match handle.await {
            Ok(Ok(outcome)) if outcome.succeeded => Attempt::Outcome(outcome),
            Ok(Ok(outcome)) => Attempt::Failed {
                error: ProbeError::from_outcome(&outcome),
                outcome: Some(outcome),
            },
            Ok(Err(error)) => Attempt::Failed {
                error,
                outcome: None,
            },
            Err(error) => Attempt::Failed {
                error: error.into(),
                outcome: None,
            },
        }
    }

    async fn handle_seats_found(&self, delivery: &Delivery, outcome: ProbeOutcome) {
        let job_id = delivery.id;
        let alert = SeatAlert {
            job_id,
            route: delivery.payload.route.clone(),
            first_found_time: outcome.first_found_time.clone(),
            results: outcome.results.clone(),
        };
        let transition = Transition::Complete {
            outcome: Some(outcome),
            reason: CompletionReason::SeatsFound,
        };
        match self.transition(job_id, transition).await {
            Ok(true) => {
                tracing::info!(
                    %job_id,
                    first_found_time = ?alert.first_found_time,
                    "Seats found for job {job_id}"
                );
                self.notify(alert);
                self.acknowledge(job_id).await
            }
            Ok(false) => self.acknowledge(job_id).await,
            Err(_) => self.snooze(job_id).await,
        }
    }

    async fn handle_no_seats(&self, delivery: &Delivery, outcome: ProbeOutcome, now: DateTime<Utc>) {
        let job_id = delivery.id;
        let next = now + delivery.payload.plan.cadence().backoff(delivery.attempt);

        let reason = if delivery.is_final_attempt() {
            Some(CompletionReason::AttemptsExhausted)
        } else if next >= delivery.payload.deadline {
            Some(CompletionReason::DeadlineExceeded)
        } else {
            None
        };
        if let Some(reason) = reason {
            tracing::debug!(%job_id, ?reason, "No seats for job {job_id} and no attempts left");
            let transition = Transition::Complete {
                outcome: Some(outcome),
                reason,
            };
            return self.finish(job_id, transition).await;
        }

        match self.transition(job_id, Transition::Reschedule { outcome }).await {
            Ok(true) => {
                tracing::debug!(%job_id, "No seats for job {job_id} yet, next attempt at {next}");
                let _ = self
                    .backend
                    .mark_retryable(job_id, next)
                    .await
                    .inspect_err(|err| {
                        tracing::error!(
                            ?err,
                            %job_id,
                            "Failed to mark job {job_id} as retryable, error: {err:?}",
                        )
                    });
            }
            Ok(false) => self.acknowledge(job_id).await,
            Err(_) => self.snooze(job_id).await,
        }
    }

    async fn handle_error(
        &self,
        delivery: &Delivery,
        error: ProbeError,
        outcome: Option<ProbeOutcome>,
        now: DateTime<Utc>,
    ) {
        let job_id = delivery.id;
        let errors = delivery.error_count + 1;

        if errors >= self.config.error_budget {
            tracing::error!(
                %job_id,
                ?error,
                "Job {job_id} failed after {errors} errors: error type: {}, message: {error}",
                error.error_type(),
            );
            let transition = Transition::Fail {
                error: error.to_string(),
                outcome,
            };
            return self.finish(job_id, transition).await;
        }

        let next = now + self.config.error_backoff.backoff(errors);
        tracing::warn!(
            %job_id,
            ?error,
            "Job {job_id} failed and will be retried at {next}: error type: {}, message: {error}",
            error.error_type(),
        );
        let transition = Transition::RetryAfterError {
            error: error.to_string(),
            outcome,
        };
        match self.transition(job_id, transition).await {
            Ok(true) => {
                let _ = self
                    .backend
                    .mark_errored(job_id, next)
                    .await
                    .inspect_err(|err| {
                        tracing::error!(
                            ?err,
                            %job_id,
                            "Failed to requeue job {job_id} after error, error: {err:?}",
                        )
                    });
            }
            Ok(false) => self.acknowledge(job_id).await,
            Err(_) => self.snooze(job_id).await,
        }
    }

    /// A queue entry whose record never appeared. Each miss counts against the error budget
    /// and the entry is dropped once the budget is spent.
    async fn handle_missing_record(&self, delivery: &Delivery) {
        let job_id = delivery.id;
        let misses = delivery.error_count + 1;
        if misses >= self.config.error_budget {
            tracing::warn!(
                %job_id,
                "Job {job_id} still has no record after {misses} checks, dropping delivery"
            );
            return self.acknowledge(job_id).await;
        }

        let next = Utc::now() + self.config.error_backoff.backoff(misses);
        tracing::debug!(%job_id, "Job {job_id} has no record yet, checking again at {next}");
        let _ = self
            .backend
            .mark_errored(job_id, next)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to requeue job {job_id} without a record, error: {err:?}",
                )
            });
    }

    /// Applies a terminal transition and acknowledges the delivery.
    async fn finish(&self, job_id: JobId, transition: Transition) {
        match self.transition(job_id, transition).await {
            Ok(_) => self.acknowledge(job_id).await,
            Err(_) => self.snooze(job_id).await,
        }
    }

    /// Applies `transition`, publishing the new record. Returns false if the stored status
    /// did not allow it.
    async fn transition(&self, job_id: JobId, transition: Transition) -> Result<bool, BackendError> {
        let target = transition.target();
        let result = self
            .backend
            .update(job_id, transition)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as {target}, error: {err:?}",
                )
            })?;
        match result {
            UpdateResult::Applied(record) => {
                self.events.publish(&record);
                Ok(true)
            }
            UpdateResult::Unchanged(record) => {
                tracing::debug!(
                    %job_id,
                    "Job {job_id} is already {}, not marking it {target}",
                    record.status
                );
                Ok(false)
            }
        }
    }

    fn notify(&self, alert: SeatAlert) {
        let sink = self.sink.clone();
        tokio::spawn(
            async move {
                let job_id = alert.job_id;
                let _ = sink.seats_found(alert).await.inspect_err(|err| {
                    tracing::error!(?err, %job_id, "Failed to notify for job {job_id}: {err}")
                });
            }
            .in_current_span(),
        );
    }

    async fn acknowledge(&self, job_id: JobId) {
        let _ = self.backend.mark_done(job_id).await.inspect_err(|err| {
            tracing::error!(
                ?err,
                %job_id,
                "Failed to acknowledge job {job_id}, error: {err:?}",
            )
        });
    }

    async fn snooze(&self, job_id: JobId) {
        let _ = self
            .backend
            .mark_snoozed(job_id, Utc::now() + SNOOZE)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to snooze job {job_id}, error: {err:?}",
                )
            });
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, EnqueuableJob, JobQueue, JobStore},
        backoff::BackoffStrategy,
        job::{JobRecord, JobStatus},
        notify::{LogNotifier, MockNotificationSink},
        testing::ScriptedProbe,
    };
    use futures::StreamExt;

    struct Harness {
        backend: InMemoryBackend,
        runner: JobRunner<InMemoryBackend>,
        stream: crate::backend::DeliveryStream,
    }

    impl Harness {
        async fn new(probe: impl Probe, sink: impl NotificationSink) -> Self {
            let backend = InMemoryBackend::new();
            let config = SeatWatchConfig::default()
                .with_error_backoff(BackoffStrategy::exponential(TimeDelta::milliseconds(1)))
                .with_probe_timeout(Duration::from_millis(200));
            let runner = JobRunner::new(
                backend.clone(),
                Arc::new(probe),
                Arc::new(sink),
                EventNotifier::default(),
                Arc::new(config),
            );
            let stream = backend.subscribe_ready_jobs().await;
            Self {
                backend,
                runner,
                stream,
            }
        }

        async fn submit(&self, job: EnqueuableJob) -> JobId {
            let id = self.backend.enqueue(job.clone()).await.unwrap();
            let record = JobRecord::waiting(
                id,
                job.payload.route,
                job.payload.deadline,
                job.max_attempts,
                Utc::now(),
            );
            self.backend.insert(record).await.unwrap();
            id
        }

        async fn run_next(&mut self) -> Option<JobId> {
            match tokio::time::timeout(Duration::from_millis(300), self.stream.next()).await {
                Ok(Some(Ok(delivery))) => {
                    let id = delivery.id;
                    self.runner.execute(delivery).await;
                    Some(id)
                }
                _ => None,
            }
        }

        async fn record(&self, id: JobId) -> JobRecord {
            self.backend.get(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn no_seats_reschedules_with_fixed_interval() {
        let mut harness = Harness::new(ScriptedProbe::no_seats(), LogNotifier).await;
        let id = harness.submit(EnqueuableJob::mock_job()).await;

        assert_eq!(harness.run_next().await, Some(id));

        let record = harness.record(id).await;
        assert_eq!(record.status, JobStatus::Waiting);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.last_outcome.map(|outcome| outcome.found_seats), Some(false));
        assert_eq!(harness.run_next().await, Some(id));
        assert_eq!(harness.record(id).await.retry_count, 2);
    }

    #[tokio::test]
    async fn final_attempt_without_seats_completes() {
        let mut harness = Harness::new(ScriptedProbe::no_seats(), LogNotifier).await;
        let id = harness.submit(EnqueuableJob::mock_job()).await;

        while harness.run_next().await.is_some() {}

        let record = harness.record(id).await;
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.completion_reason, Some(CompletionReason::AttemptsExhausted));
        assert_eq!(record.retry_count, 4);
        assert!(!record.found_seats());
    }

    #[tokio::test]
    async fn entry_without_record_is_dropped_after_error_budget() {
        let probe = ScriptedProbe::no_seats();
        let mut harness = Harness::new(probe.clone(), LogNotifier).await;
        let id = harness.backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

        for _ in 0..3 {
            assert_eq!(harness.run_next().await, Some(id));
        }

        assert_eq!(harness.run_next().await, None);
        assert_eq!(probe.calls(), 0);
        assert!(harness.backend.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn passed_deadline_completes_without_probing() {
        let probe = ScriptedProbe::no_seats();
        let mut harness = Harness::new(probe.clone(), LogNotifier).await;
        let mut job = EnqueuableJob::mock_job();
        job.payload.deadline = Utc::now() - TimeDelta::minutes(1);
        let id = harness.submit(job).await;

        harness.run_next().await;

        let record = harness.record(id).await;
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.completion_reason, Some(CompletionReason::DeadlineExceeded));
        assert_eq!(probe.calls(), 0);
        assert_eq!(harness.run_next().await, None);
    }

    #[tokio::test]
    async fn seats_found_completes_and_notifies_once() {
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        let mut sink = MockNotificationSink::new();
        sink.expect_seats_found().times(1).returning(move |alert| {
            sender.send(alert).unwrap();
            Ok(())
        });
        let mut harness = Harness::new(ScriptedProbe::seats_from(1, "19:40"), sink).await;
        let id = harness.submit(EnqueuableJob::mock_job()).await;

        harness.run_next().await;

        let record = harness.record(id).await;
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.completion_reason, Some(CompletionReason::SeatsFound));
        let alert = receiver.recv().await.unwrap();
        assert_eq!(alert.job_id, id);
        assert_eq!(alert.first_found_time.as_deref(), Some("19:40"));
        assert_eq!(harness.run_next().await, None);
    }

    #[tokio::test]
    async fn errors_fail_the_job_after_the_budget() {
        let probe = ScriptedProbe::failing();
        let mut harness = Harness::new(probe.clone(), LogNotifier).await;
        let id = harness.submit(EnqueuableJob::mock_job()).await;

        harness.run_next().await;
        let record = harness.record(id).await;
        assert_eq!(record.status, JobStatus::Waiting);
        assert_eq!(record.retry_count, 0);
        assert!(record.error.is_some());

        while harness.run_next().await.is_some() {}

        let record = harness.record(id).await;
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(probe.calls(), 3);
        assert!(record.error.unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn unsuccessful_outcome_counts_as_error() {
        let probe = ScriptedProbe::new(|_, _| {
            Ok(ProbeOutcome::failed("session expired", Utc::now(), 3))
        });
        let mut harness = Harness::new(probe, LogNotifier).await;
        let id = harness.submit(EnqueuableJob::mock_job()).await;

        while harness.run_next().await.is_some() {}

        let record = harness.record(id).await;
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("session expired"));
        assert_eq!(record.last_outcome.map(|outcome| outcome.succeeded), Some(false));
    }

    #[tokio::test]
    async fn slow_probe_times_out() {
        let probe = ScriptedProbe::no_seats().with_delay(Duration::from_secs(5));
        let mut harness = Harness::new(probe, LogNotifier).await;
        let id = harness.submit(EnqueuableJob::mock_job()).await;

        harness.run_next().await;

        let record = harness.record(id).await;
        assert_eq!(record.status, JobStatus::Waiting);
        assert!(record.error.unwrap().contains("did not finish"));
    }

    #[tokio::test]
    async fn panicking_probe_is_an_error() {
        let probe = ScriptedProbe::new(|_, _| panic!("parser blew up"));
        let mut harness = Harness::new(probe, LogNotifier).await;
        let id = harness.submit(EnqueuableJob::mock_job()).await;

        harness.run_next().await;

        let record = harness.record(id).await;
        assert_eq!(record.status, JobStatus::Waiting);
        assert!(record.error.unwrap().contains("parser blew up"));
    }

    #[tokio::test]
    async fn cancelled_job_is_acknowledged_without_probing() {
        let probe = ScriptedProbe::no_seats();
        let mut harness = Harness::new(probe.clone(), LogNotifier).await;
        let id = harness.submit(EnqueuableJob::mock_job()).await;
        harness.backend.update(id, Transition::Cancel).await.unwrap();

        harness.run_next().await;

        assert_eq!(harness.record(id).await.status, JobStatus::Cancelled);
        assert_eq!(probe.calls(), 0);
        assert_eq!(harness.run_next().await, None);
    }

    #[tokio::test]
    async fn cancellation_during_probe_wins() {
        let backend_slot: Arc<std::sync::Mutex<Option<(InMemoryBackend, JobId)>>> =
            Default::default();
        let probe = ScriptedProbe::new({
            let backend_slot = backend_slot.clone();
            move |_, route| {
                if let Some((backend, id)) = backend_slot.lock().unwrap().clone() {
                    futures::executor::block_on(backend.update(id, Transition::Cancel)).unwrap();
                }
                Ok(ScriptedProbe::listing(route, Some("18:40")))
            }
        });
        let mut harness = Harness::new(probe, LogNotifier).await;
        let id = harness.submit(EnqueuableJob::mock_job()).await;
        *backend_slot.lock().unwrap() = Some((harness.backend.clone(), id));

        harness.run_next().await;

        let record = harness.record(id).await;
        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(record.last_outcome.is_none());
        assert_eq!(harness.run_next().await, None);
    }

    #[tokio::test]
    async fn delivery_without_record_is_snoozed() {
        let probe = ScriptedProbe::no_seats();
        let mut harness = Harness::new(probe.clone(), LogNotifier).await;
        let id = harness.backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

        assert_eq!(harness.run_next().await, Some(id));

        assert_eq!(probe.calls(), 0);
        assert!(harness.backend.get(id).await.unwrap().is_none());
    }
}
