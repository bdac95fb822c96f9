use seatwatch::job::query::JobQuery;
use sqlx::{Postgres, QueryBuilder};

use crate::types::JobStatus;

pub(crate) const JOB_COLUMNS: &str = "id, route, status, retry_count, max_attempts, deadline, \
    last_outcome, completion_reason, error, created_at, updated_at, completed_at";

pub(crate) const QUEUE_COLUMNS: &str =
    "id, payload, attempt, max_attempts, error_count, priority, scheduled_at";

pub(crate) trait ToQuery {
    fn query(&self) -> QueryBuilder<'_, Postgres>;
}

impl ToQuery for JobQuery {
    fn query(&self) -> QueryBuilder<'_, Postgres> {
        let mut builder = QueryBuilder::new("SELECT ");
        builder.push(JOB_COLUMNS);
        builder.push(" FROM seatwatch_jobs");
        if let Some(status) = self.status {
            builder.push(" WHERE status = ");
            builder.push_bind(JobStatus::from(status));
        }
        builder.push(" ORDER BY created_at DESC, id DESC LIMIT ");
        builder.push_bind(i64::from(self.effective_limit()));
        builder.push(" OFFSET ");
        builder.push_bind(i64::from(self.offset));
        builder
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn to_query_for_job_query_test() {
        assert_eq!(
            JobQuery::all().query().into_sql(),
            format!(
                "SELECT {JOB_COLUMNS} FROM seatwatch_jobs \
                ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2"
            )
        );

        assert_eq!(
            JobQuery::all()
                .with_status(seatwatch::job::JobStatus::Failed)
                .with_limit(10)
                .with_offset(20)
                .query()
                .into_sql(),
            format!(
                "SELECT {JOB_COLUMNS} FROM seatwatch_jobs WHERE status = $1 \
                ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
            )
        );
    }
}
