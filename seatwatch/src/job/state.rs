//! Status transitions of a [`JobRecord`].
//!
//! Every write to a record goes through [`JobRecord::apply`], which checks the current status
//! before changing anything. A transition that is not allowed from the stored status leaves the
//! record untouched, so replaying an update or racing a cancellation is harmless.
use chrono::{DateTime, Utc};

use crate::route::ProbeOutcome;

use super::{CompletionReason, JobRecord, JobStatus};

/// A requested change to a job's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// A worker has picked the job up.
    Activate,
    /// The probe found no seats yet and another attempt is affordable.
    Reschedule { outcome: ProbeOutcome },
    /// The probe could not reach the source; another try is scheduled.
    RetryAfterError {
        error: String,
        outcome: Option<ProbeOutcome>,
    },
    /// The job is done. `outcome` replaces the last outcome when present.
    Complete {
        outcome: Option<ProbeOutcome>,
        reason: CompletionReason,
    },
    /// The infrastructure error budget is spent.
    Fail {
        error: String,
        outcome: Option<ProbeOutcome>,
    },
    Cancel,
}

impl Transition {
    pub fn target(&self) -> JobStatus {
        match self {
            Self::Activate => JobStatus::Active,
            Self::Reschedule { .. } | Self::RetryAfterError { .. } => JobStatus::Waiting,
            Self::Complete { .. } => JobStatus::Completed,
            Self::Fail { .. } => JobStatus::Failed,
            Self::Cancel => JobStatus::Cancelled,
        }
    }

    /// Whether this transition may be applied to a record currently in `status`.
    ///
    /// `Activate` is accepted from `active` so that a delivery redelivered after a worker died
    /// mid-probe can resume.
    pub fn allowed_from(&self, status: JobStatus) -> bool {
        match self {
            Self::Activate | Self::Cancel => {
                matches!(status, JobStatus::Waiting | JobStatus::Active)
            }
            _ => status == JobStatus::Active,
        }
    }

    fn outcome(&self) -> Option<&ProbeOutcome> {
        match self {
            Self::Reschedule { outcome } => Some(outcome),
            Self::RetryAfterError { outcome, .. }
            | Self::Complete { outcome, .. }
            | Self::Fail { outcome, .. } => outcome.as_ref(),
            Self::Activate | Self::Cancel => None,
        }
    }

    /// Only a completion may carry an outcome that found seats.
    fn is_consistent(&self) -> bool {
        match self {
            Self::Complete {
                outcome,
                reason: CompletionReason::SeatsFound,
            } => outcome.as_ref().is_some_and(|outcome| outcome.found_seats),
            Self::Complete { .. } => true,
            other => !other.outcome().is_some_and(|outcome| outcome.found_seats),
        }
    }
}

/// The result of asking a store to apply a [`Transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateResult {
    /// The transition was applied; the record is the new state.
    Applied(JobRecord),
    /// The stored status did not allow the transition; the record is the stored state.
    Unchanged(JobRecord),
}

impl UpdateResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn record(&self) -> &JobRecord {
        match self {
            Self::Applied(record) | Self::Unchanged(record) => record,
        }
    }

    pub fn into_record(self) -> JobRecord {
        match self {
            Self::Applied(record) | Self::Unchanged(record) => record,
        }
    }
}

impl JobRecord {
    /// Applies `transition` if the current status allows it, returning whether it did.
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) -> bool {
        if !transition.allowed_from(self.status) || !transition.is_consistent() {
            return false;
        }
        self.status = transition.target();
        self.updated_at = now;
        match transition {
            Transition::Activate | Transition::Cancel => {}
            Transition::Reschedule { outcome } => {
                self.retry_count += 1;
                self.error = None;
                self.last_outcome = Some(outcome);
            }
            Transition::RetryAfterError { error, outcome } => {
                self.error = Some(error);
                if outcome.is_some() {
                    self.last_outcome = outcome;
                }
            }
            Transition::Complete { outcome, reason } => {
                self.completion_reason = Some(reason);
                if outcome.is_some() {
                    self.error = None;
                    self.last_outcome = outcome;
                }
            }
            Transition::Fail { error, outcome } => {
                self.error = Some(error);
                if outcome.is_some() {
                    self.last_outcome = outcome;
                }
            }
        }
        if self.status.is_terminal() {
            self.completed_at = Some(now);
        }
        true
    }

    /// Applies `transition` to a copy, the shape every store returns.
    pub fn transitioned(mut self, transition: Transition, now: DateTime<Utc>) -> UpdateResult {
        if self.apply(transition, now) {
            UpdateResult::Applied(self)
        } else {
            UpdateResult::Unchanged(self)
        }
    }
}
