use chrono::{DateTime, Utc};

use crate::job::{query::JobQuery, JobRecord};

use super::memory::{EntryState, QueueEntry};

pub(super) trait Queryable<T> {
    fn matches(&self, item: &T) -> bool;
}

impl Queryable<JobRecord> for JobQuery {
    fn matches(&self, record: &JobRecord) -> bool {
        self.status.map_or(true, |status| record.status == status)
    }
}

/// Ready entries due no later than the wrapped instant.
pub(super) struct DueBy(pub DateTime<Utc>);

impl Queryable<QueueEntry> for DueBy {
    fn matches(&self, entry: &QueueEntry) -> bool {
        entry.state == EntryState::Ready && entry.scheduled_at <= self.0
    }
}

/// Leased entries whose lease began before the wrapped instant.
pub(super) struct LeasedBefore(pub DateTime<Utc>);

impl Queryable<QueueEntry> for LeasedBefore {
    fn matches(&self, entry: &QueueEntry) -> bool {
        entry.state == EntryState::Leased && entry.leased_at.is_some_and(|at| at < self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::JobStatus;

    #[test]
    fn job_query_status_filter() {
        let waiting = JobRecord::mock();
        let failed = JobRecord::mock().with_status(JobStatus::Failed);

        assert!(JobQuery::all().matches(&waiting));
        assert!(JobQuery::all().matches(&failed));
        assert!(!JobQuery::all()
            .with_status(JobStatus::Failed)
            .matches(&waiting));
        assert!(JobQuery::all()
            .with_status(JobStatus::Failed)
            .matches(&failed));
    }
}
