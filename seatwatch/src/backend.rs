//! Storage seams: the delayed work queue and the durable job record store.
//!
//! A [`Backend`] provides both. The queue only knows about deliveries and leases; the store owns
//! the job status and is the source of truth for cancellation.
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    job::{
        query::JobQuery,
        state::{Transition, UpdateResult},
        JobId, JobRecord, JobStats,
    },
    planner::RetryPlan,
    route::RouteQuery,
};

pub mod memory;
mod queryable;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Everything a worker needs to run an attempt, stored with the queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub route: RouteQuery,
    pub deadline: DateTime<Utc>,
    pub plan: RetryPlan,
}

/// A queue entry to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuableJob {
    pub payload: JobPayload,
    /// Lower values are served first.
    pub priority: u16,
    pub scheduled_at: DateTime<Utc>,
    pub max_attempts: u32,
}

/// A leased queue entry handed to exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: JobId,
    pub payload: JobPayload,
    /// Domain attempts consumed including this one, starting at 1.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Consecutive infrastructure failures before this delivery.
    pub error_count: u32,
    pub priority: u16,
    pub scheduled_at: DateTime<Utc>,
}

impl Delivery {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BackendError>> + Send>>;

/// A durable, delay-capable work queue with at-least-once delivery.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError>;

    /// A stream of ready entries. Each entry is leased to a single subscriber at a time.
    async fn subscribe_ready_jobs(&self) -> DeliveryStream;

    /// Makes a leased entry ready again at `next_scheduled_at` after a "no seats yet" attempt.
    ///
    /// The attempt stays consumed and the infrastructure error count is reset.
    async fn mark_retryable(
        &self,
        id: JobId,
        next_scheduled_at: DateTime<Utc>,
    ) -> Result<(), BackendError>;

    /// Makes a leased entry ready again after an infrastructure failure.
    ///
    /// The attempt is refunded and the error count incremented.
    async fn mark_errored(
        &self,
        id: JobId,
        next_scheduled_at: DateTime<Utc>,
    ) -> Result<(), BackendError>;

    /// Puts a leased entry back without consuming an attempt.
    async fn mark_snoozed(
        &self,
        id: JobId,
        next_scheduled_at: DateTime<Utc>,
    ) -> Result<(), BackendError>;

    /// Acknowledges an entry; it is never delivered again.
    async fn mark_done(&self, id: JobId) -> Result<(), BackendError>;

    /// Withdraws an entry. A currently leased entry is simply never made ready again.
    async fn cancel(&self, id: JobId) -> Result<(), BackendError>;

    /// Returns entries leased longer than `lease_timeout` ago to the ready state, refunding
    /// the attempt. Lease age is measured on the clock that stamped the lease.
    async fn requeue_expired_leases(&self, lease_timeout: TimeDelta) -> Result<u64, BackendError>;
}

/// Durable job records with compare-and-set status updates.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, record: JobRecord) -> Result<(), BackendError>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, BackendError>;

    /// Atomically applies `transition` if the stored status allows it.
    async fn update(&self, id: JobId, transition: Transition)
        -> Result<UpdateResult, BackendError>;

    /// Records matching `query`, newest first.
    async fn list(&self, query: JobQuery) -> Result<Vec<JobRecord>, BackendError>;

    async fn stats(&self) -> Result<JobStats, BackendError>;
}

/// A queue and a store sharing one id space.
pub trait Backend: JobQueue + JobStore + Clone + 'static {}

impl<T> Backend for T where T: JobQueue + JobStore + Clone + 'static {}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Error encoding or decoding data")]
    EncodeDecodeError(#[from] serde_json::Error),
    #[error("System in bad state")]
    BadState,
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("Job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}
