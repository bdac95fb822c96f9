//! A fixed pool of workers sharing one ready-job queue and one rate limiter.
use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{backend::Backend, job::runner::JobRunner};

/// Pause after the queue stream reports an error, so a broken backend is not spun on.
const STREAM_ERROR_DELAY: Duration = Duration::from_millis(500);

pub(crate) struct WorkerPool<B: Backend> {
    runner: Arc<JobRunner<B>>,
    limiter: Arc<DefaultDirectRateLimiter>,
    backend: B,
    workers: usize,
}

impl<B> WorkerPool<B>
where
    B: Backend,
{
    pub(crate) fn new(backend: B, runner: JobRunner<B>, workers: usize, quota: Quota) -> Self {
        Self {
            runner: Arc::new(runner),
            limiter: Arc::new(RateLimiter::direct(quota)),
            backend,
            workers,
        }
    }

    pub(crate) fn spawn(self, cancellation_token: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|worker| {
                tokio::spawn(Self::work(
                    worker,
                    self.backend.clone(),
                    self.runner.clone(),
                    self.limiter.clone(),
                    cancellation_token.clone(),
                ))
            })
            .collect()
    }

    async fn work(
        worker: usize,
        backend: B,
        runner: Arc<JobRunner<B>>,
        limiter: Arc<DefaultDirectRateLimiter>,
        cancellation_token: CancellationToken,
    ) {
        let mut stream = backend.subscribe_ready_jobs().await;
        tracing::debug!(worker, "Worker started");
        loop {
            tokio::select! {
                _ = limiter.until_ready() => {},
                _ = cancellation_token.cancelled() => break,
            }
            let delivery = tokio::select! {
                delivery = stream.next() => delivery,
                _ = cancellation_token.cancelled() => break,
            };
            match delivery {
                Some(Ok(delivery)) => runner.execute(delivery).await,
                Some(Err(error)) => {
                    tracing::warn!(?error, worker, "Failed to get from stream: {error}");
                    tokio::time::sleep(STREAM_ERROR_DELAY).await;
                }
                None => {
                    tracing::warn!(worker, "Ready job stream ended");
                    break;
                }
            }
        }
        tracing::debug!(worker, "Shutting down worker");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, EnqueuableJob, JobQueue, JobStore},
        events::EventNotifier,
        job::{JobRecord, JobStatus},
        notify::LogNotifier,
        testing::{wait_for_terminal, ScriptedProbe},
        RateLimit, SeatWatchConfig,
    };
    use chrono::Utc;
    use std::num::NonZeroU32;

    async fn pool(
        probe: ScriptedProbe,
        workers: usize,
        quota: Quota,
    ) -> (InMemoryBackend, WorkerPool<InMemoryBackend>) {
        let backend = InMemoryBackend::new();
        let runner = JobRunner::new(
            backend.clone(),
            Arc::new(probe),
            Arc::new(LogNotifier),
            EventNotifier::default(),
            Arc::new(SeatWatchConfig::default()),
        );
        (backend.clone(), WorkerPool::new(backend, runner, workers, quota))
    }

    async fn submit(backend: &InMemoryBackend, job: EnqueuableJob) -> crate::job::JobId {
        let id = backend.enqueue(job.clone()).await.unwrap();
        backend
            .insert(JobRecord::waiting(
                id,
                job.payload.route,
                job.payload.deadline,
                job.max_attempts,
                Utc::now(),
            ))
            .await
            .unwrap();
        id
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn workers_drain_the_queue() {
        let (backend, pool) = pool(
            ScriptedProbe::seats_from(1, "18:40"),
            3,
            Quota::per_second(NonZeroU32::new(1000).unwrap()),
        )
        .await;
        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(submit(&backend, EnqueuableJob::mock_job()).await);
        }
        let token = CancellationToken::new();

        let handles = pool.spawn(token.clone());
        for id in ids {
            let record = wait_for_terminal(&backend, id, Duration::from_secs(5)).await;
            assert_eq!(record.status, JobStatus::Completed);
        }
        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn rate_limit_bounds_dequeues() {
        let probe = ScriptedProbe::seats_from(1, "18:40");
        let (backend, pool) = pool(
            probe.clone(),
            4,
            RateLimit {
                max_jobs: 5,
                per: Duration::from_secs(1),
            }
            .quota()
            .unwrap(),
        )
        .await;
        for _ in 0..4 {
            submit(&backend, EnqueuableJob::mock_job()).await;
        }
        let token = CancellationToken::new();

        let handles = pool.spawn(token.clone());
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(probe.calls() <= 2, "probed {} times", probe.calls());
        assert!(probe.calls() >= 1);
    }

    #[tokio::test]
    async fn shutdown_stops_idle_workers() {
        let (_, pool) = pool(
            ScriptedProbe::no_seats(),
            2,
            Quota::per_second(NonZeroU32::new(10).unwrap()),
        )
        .await;
        let token = CancellationToken::new();

        let handles = pool.spawn(token.clone());
        token.cancel();

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
