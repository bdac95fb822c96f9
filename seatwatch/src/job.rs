use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::route::{ProbeOutcome, RouteQuery};

pub mod builder;
pub mod query;
pub(crate) mod runner;
pub mod state;

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i32);

impl From<i32> for JobId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<JobId> for i32 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Waiting,
        Self::Active,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended up `completed`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompletionReason {
    SeatsFound,
    DeadlineExceeded,
    AttemptsExhausted,
}

/// The durable record of a watch job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub route: RouteQuery,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_attempts: u32,
    pub deadline: DateTime<Utc>,
    #[serde(default)]
    pub last_outcome: Option<ProbeOutcome>,
    #[serde(default)]
    pub completion_reason: Option<CompletionReason>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// A freshly submitted job waiting for its first probe.
    pub fn waiting(
        id: JobId,
        route: RouteQuery,
        deadline: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            route,
            status: JobStatus::Waiting,
            retry_count: 0,
            max_attempts,
            deadline,
            last_outcome: None,
            completion_reason: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn found_seats(&self) -> bool {
        self.last_outcome
            .as_ref()
            .is_some_and(|outcome| outcome.found_seats)
    }
}

/// Number of jobs in each status, with totals over finished jobs.
///
/// A job is finished once it is `completed` or `failed`. Cancelled jobs are counted by status
/// only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Finished jobs whose last probe found seats.
    #[serde(default)]
    pub found_seats: u64,
    /// Attempts made by finished jobs, `retry_count + 1` each.
    #[serde(default)]
    pub total_checks: u64,
    /// Time from submission to completion summed over finished jobs.
    #[serde(default)]
    pub total_duration_ms: u64,
}

impl JobStats {
    pub fn add(&mut self, status: JobStatus, count: u64) {
        let slot = match status {
            JobStatus::Waiting => &mut self.waiting,
            JobStatus::Active => &mut self.active,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }

    /// Counts `record` by status and, once it is finished, towards the totals.
    pub fn add_record(&mut self, record: &JobRecord) {
        self.add(record.status, 1);
        if !matches!(record.status, JobStatus::Completed | JobStatus::Failed) {
            return;
        }
        if record.found_seats() {
            self.found_seats += 1;
        }
        self.total_checks += u64::from(record.retry_count) + 1;
        if let Some(completed_at) = record.completed_at {
            let duration = (completed_at - record.created_at).num_milliseconds();
            self.total_duration_ms += duration.max(0) as u64;
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.cancelled
    }

    pub fn finished(&self) -> u64 {
        self.completed + self.failed
    }

    /// Percentage of finished jobs that found seats.
    pub fn found_seats_rate(&self) -> f64 {
        self.per_finished(self.found_seats as f64 * 100.0)
    }

    pub fn avg_checks_per_job(&self) -> f64 {
        self.per_finished(self.total_checks as f64)
    }

    pub fn avg_duration_secs(&self) -> f64 {
        self.per_finished(self.total_duration_ms as f64 / 1000.0)
    }

    fn per_finished(&self, value: f64) -> f64 {
        match self.finished() {
            0 => 0.0,
            finished => value / finished as f64,
        }
    }
}
