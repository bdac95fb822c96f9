use chrono::{DateTime, Utc};
use seatwatch::{
    backend::{BackendError, Delivery},
    job::{CompletionReason, JobRecord},
};
use serde::Deserialize;
use sqlx::prelude::FromRow;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "seatwatch_job_status", rename_all = "lowercase")]
pub(crate) enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl From<JobStatus> for seatwatch::job::JobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Waiting => Self::Waiting,
            JobStatus::Active => Self::Active,
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
            JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl From<seatwatch::job::JobStatus> for JobStatus {
    fn from(value: seatwatch::job::JobStatus) -> Self {
        match value {
            seatwatch::job::JobStatus::Waiting => Self::Waiting,
            seatwatch::job::JobStatus::Active => Self::Active,
            seatwatch::job::JobStatus::Completed => Self::Completed,
            seatwatch::job::JobStatus::Failed => Self::Failed,
            seatwatch::job::JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "seatwatch_queue_state", rename_all = "lowercase")]
pub(crate) enum QueueState {
    Ready,
    Leased,
    Done,
    Cancelled,
}

#[derive(Debug, FromRow)]
pub(crate) struct QueueEntry {
    pub id: i32,
    pub payload: serde_json::Value,
    pub attempt: i32,
    pub max_attempts: i32,
    pub error_count: i32,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
}

impl TryFrom<QueueEntry> for Delivery {
    type Error = BackendError;

    fn try_from(value: QueueEntry) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.into(),
            payload: serde_json::from_value(value.payload)?,
            attempt: unsigned(value.attempt)?,
            max_attempts: unsigned(value.max_attempts)?,
            error_count: unsigned(value.error_count)?,
            priority: u16::try_from(value.priority).map_err(|_| BackendError::BadState)?,
            scheduled_at: value.scheduled_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct Job {
    pub id: i32,
    pub route: serde_json::Value,
    pub status: JobStatus,
    pub retry_count: i32,
    pub max_attempts: i32,
    pub deadline: DateTime<Utc>,
    pub last_outcome: Option<serde_json::Value>,
    pub completion_reason: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<Job> for JobRecord {
    type Error = BackendError;

    fn try_from(value: Job) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.into(),
            route: serde_json::from_value(value.route)?,
            status: value.status.into(),
            retry_count: unsigned(value.retry_count)?,
            max_attempts: unsigned(value.max_attempts)?,
            deadline: value.deadline,
            last_outcome: value.last_outcome.map(serde_json::from_value).transpose()?,
            completion_reason: value
                .completion_reason
                .map(|reason| serde_json::from_value(serde_json::Value::String(reason)))
                .transpose()?,
            error: value.error,
            created_at: value.created_at,
            updated_at: value.updated_at,
            completed_at: value.completed_at,
        })
    }
}

/// The textual form stored in `seatwatch_jobs.completion_reason`.
pub(crate) fn reason_text(reason: CompletionReason) -> Result<String, BackendError> {
    match serde_json::to_value(reason)? {
        serde_json::Value::String(text) => Ok(text),
        _ => Err(BackendError::BadState),
    }
}

/// Payload of the `seatwatch_scheduled` channel.
#[derive(Deserialize, Debug)]
pub(crate) struct Notification {
    pub id: i32,
    pub scheduled_at: DateTime<Utc>,
}

fn unsigned(value: i32) -> Result<u32, BackendError> {
    u32::try_from(value).map_err(|_| BackendError::BadState)
}

pub(crate) fn signed(value: u32) -> Result<i32, BackendError> {
    i32::try_from(value).map_err(|_| BackendError::BadState)
}
