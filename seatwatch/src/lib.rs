//! Deadline-bounded availability probing.
//!
//! A [`SeatWatch`] instance owns a pool of workers that repeatedly probe a route for seats on a
//! fixed cadence until seats are found or the route's deadline passes. Jobs are submitted,
//! cancelled and inspected through a [`Scheduler`], and every state change is fanned out to
//! event stream subscribers.
//!
//! ```no_run
//! # use seatwatch::prelude::*;
//! # use seatwatch::backend::memory::InMemoryBackend;
//! # struct SourceProbe;
//! # #[async_trait::async_trait]
//! # impl Probe for SourceProbe {
//! #     async fn probe(&self, route: &RouteQuery) -> Result<ProbeOutcome, ProbeError> {
//! #         Ok(ProbeOutcome::from_slots(route, vec![], chrono::Utc::now(), 0))
//! #     }
//! # }
//! # async fn run() -> Result<(), SeatWatchError> {
//! let seatwatch = SeatWatch::new(InMemoryBackend::new())
//!     .with_config(SeatWatchConfig::default().with_workers(3))?
//!     .with_workers(SourceProbe, LogNotifier)?
//!     .with_lease_reaper();
//!
//! let route = RouteQuery::new("4100", "3600", "11월", "18", ["18:40", "19:40"])?;
//! let job_id = JobBuilder::new(route)
//!     .submit_to(&seatwatch.scheduler())
//!     .await?;
//!
//! seatwatch.scheduler().cancel(job_id).await?;
//! seatwatch.graceful_shutdown().await?;
//! # Ok(())
//! # }
//! ```
use std::sync::Arc;

pub mod backend;
pub mod backoff;
pub mod cancellation;
mod config;
pub mod events;
pub mod job;
pub mod notify;
pub mod planner;
pub mod prelude;
pub mod probe;
mod reaper;
pub mod route;
mod scheduler;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod worker;

use backend::{Backend, BackendError};
pub use config::{RateLimit, SeatWatchConfig, DEFAULT_ERROR_BACKOFF};
use job::{runner::JobRunner, JobId};
use notify::NotificationSink;
use planner::PlanError;
use probe::Probe;
use reaper::LeaseReaper;
use route::RouteError;
pub use scheduler::Scheduler;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use worker::WorkerPool;

/// Owns the background tasks of a seatwatch process: the worker pool and the lease reaper.
pub struct SeatWatch<B: Backend> {
    backend: B,
    config: Arc<SeatWatchConfig>,
    scheduler: Scheduler<B>,
    cancellation_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl<B> SeatWatch<B>
where
    B: Backend,
{
    pub fn new(backend: B) -> Self {
        let config = Arc::new(SeatWatchConfig::default());
        Self {
            scheduler: Scheduler::with_shared_config(backend.clone(), config.clone()),
            backend,
            config,
            cancellation_token: Default::default(),
            handles: Vec::new(),
        }
    }

    /// Replaces the configuration. Must be called before any tasks are started.
    pub fn with_config(self, config: SeatWatchConfig) -> Result<Self, SeatWatchError> {
        config.validate()?;
        if !self.handles.is_empty() {
            return Err(SeatWatchError::InvalidConfig(
                "configuration cannot change once tasks are running".to_owned(),
            ));
        }
        let config = Arc::new(config);
        Ok(Self {
            scheduler: Scheduler::with_shared_config(self.backend.clone(), config.clone()),
            config,
            ..self
        })
    }

    /// A handle for submitting and managing jobs. Updates from this instance's workers are
    /// published to its subscribers.
    pub fn scheduler(&self) -> Scheduler<B> {
        self.scheduler.clone()
    }

    /// Starts the configured number of workers probing with `probe` and reporting found seats
    /// to `sink`.
    pub fn with_workers(
        mut self,
        probe: impl Probe,
        sink: impl NotificationSink,
    ) -> Result<Self, SeatWatchError> {
        let quota = self.config.rate_limit.quota().ok_or_else(|| {
            SeatWatchError::InvalidConfig("rate limit does not allow any jobs".to_owned())
        })?;
        let runner = JobRunner::new(
            self.backend.clone(),
            Arc::new(probe),
            Arc::new(sink),
            self.scheduler.events().clone(),
            self.config.clone(),
        );
        tracing::debug!(workers = self.config.workers, "Starting workers");
        let handles = WorkerPool::new(self.backend.clone(), runner, self.config.workers, quota)
            .spawn(self.cancellation_token.clone());
        self.handles.extend(handles);
        Ok(self)
    }

    /// Periodically returns deliveries leased for longer than the lease timeout to the queue.
    pub fn with_lease_reaper(mut self) -> Self {
        let handle = LeaseReaper::new(
            self.backend.clone(),
            self.config.lease_timeout,
            self.config.reap_interval,
        )
        .spawn(self.cancellation_token.clone());
        self.handles.push(handle);
        self
    }

    /// Stops taking new deliveries and waits for in-flight attempts to finish.
    pub async fn graceful_shutdown(self) -> Result<(), SeatWatchError> {
        tracing::debug!("Shutting down seatwatch tasks");
        self.cancellation_token.cancel();
        futures::future::join_all(self.handles)
            .await
            .into_iter()
            .try_for_each(|result| result.map_err(|_| SeatWatchError::GracefulShutdownFailed))
    }
}

#[derive(Debug, Error)]
pub enum SeatWatchError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Error communicating with the backend")]
    BackendError(#[from] BackendError),
    #[error("Invalid route: {0}")]
    InvalidRoute(#[from] RouteError),
    #[error("Cannot plan retries: {0}")]
    Plan(#[from] PlanError),
    #[error("{0} not found")]
    JobNotFound(JobId),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Cannot schedule the first run {0} from now")]
    InvalidSchedule(chrono::TimeDelta),
}
