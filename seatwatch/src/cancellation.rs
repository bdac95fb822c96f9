use crate::{
    backend::{BackendError, JobStore},
    job::{JobId, JobRecord, JobStatus},
};

/// What the store says about a delivery a worker is about to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    /// The job may run.
    Open(JobRecord),
    /// The job is cancelled or otherwise terminal and must not be probed again.
    Closed(JobRecord),
    /// No record exists yet.
    Missing,
}

/// Cooperative cancellation backed by the job store. It never interrupts a running probe.
#[derive(Debug, Clone)]
pub struct CancellationGate<S> {
    store: S,
}

impl<S> CancellationGate<S>
where
    S: JobStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn is_cancelled(&self, id: JobId) -> Result<bool, BackendError> {
        Ok(self
            .store
            .get(id)
            .await?
            .is_some_and(|record| record.status == JobStatus::Cancelled))
    }

    pub async fn check(&self, id: JobId) -> Result<Gate, BackendError> {
        Ok(match self.store.get(id).await? {
            None => Gate::Missing,
            Some(record) if record.status.is_terminal() => Gate::Closed(record),
            Some(record) => Gate::Open(record),
        })
    }
}
