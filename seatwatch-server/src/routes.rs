//! The HTTP API over a [`Scheduler`].
use std::convert::Infallible;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    routing::get,
    Json, Router,
};
use chrono::TimeDelta;
use futures::{Stream, StreamExt};
use seatwatch::{
    backend::Backend,
    events::JobEvent,
    job::{builder::JobBuilder, query::JobQuery, JobId, JobRecord, JobStats},
    route::RouteQuery,
    Scheduler,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ApiError;

pub fn router<B: Backend>(scheduler: Scheduler<B>) -> Router {
    Router::new()
        .route("/health", get(health::<B>))
        .route("/api/jobs", get(list_jobs::<B>).post(submit_job::<B>))
        .route("/api/jobs/stream", get(stream_events::<B>))
        .route("/api/jobs/{id}", get(job_status::<B>).delete(cancel_job::<B>))
        .route("/api/stats", get(stats::<B>))
        .with_state(scheduler)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(flatten)]
    pub route: RouteQuery,
    pub priority: Option<u16>,
    /// Milliseconds to wait before the first probe.
    pub delay: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: JobId,
}

/// POST /api/jobs
async fn submit_job<B: Backend>(
    State(scheduler): State<Scheduler<B>>,
    request: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(request) = request.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;

    let mut job = JobBuilder::new(request.route);
    if let Some(priority) = request.priority {
        job = job.with_priority(priority);
    }
    if let Some(delay) = request.delay {
        if delay < 0 {
            return Err(ApiError::BadRequest("delay must not be negative".to_owned()));
        }
        let delay = TimeDelta::try_milliseconds(delay)
            .ok_or_else(|| ApiError::BadRequest(format!("delay {delay} is out of range")))?;
        job = job.schedule_in(delay);
    }

    let job_id = scheduler.submit(job).await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { job_id })))
}

/// DELETE /api/jobs/{id}
async fn cancel_job<B: Backend>(
    State(scheduler): State<Scheduler<B>>,
    Path(id): Path<i32>,
) -> Result<Json<JobRecord>, ApiError> {
    Ok(Json(scheduler.cancel(id.into()).await?))
}

/// GET /api/jobs/{id}
async fn job_status<B: Backend>(
    State(scheduler): State<Scheduler<B>>,
    Path(id): Path<i32>,
) -> Result<Json<JobRecord>, ApiError> {
    Ok(Json(scheduler.status(id.into()).await?))
}

/// GET /api/jobs?status=&limit=&offset=
async fn list_jobs<B: Backend>(
    State(scheduler): State<Scheduler<B>>,
    Query(query): Query<JobQuery>,
) -> Result<Json<Vec<JobRecord>>, ApiError> {
    Ok(Json(scheduler.list(query).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: JobStats,
    pub found_seats_rate: f64,
    pub avg_checks_per_job: f64,
    pub avg_duration_seconds: f64,
}

impl From<JobStats> for StatsResponse {
    fn from(stats: JobStats) -> Self {
        Self {
            found_seats_rate: stats.found_seats_rate(),
            avg_checks_per_job: stats.avg_checks_per_job(),
            avg_duration_seconds: stats.avg_duration_secs(),
            stats,
        }
    }
}

/// GET /api/stats
async fn stats<B: Backend>(
    State(scheduler): State<Scheduler<B>>,
) -> Result<Json<StatsResponse>, ApiError> {
    Ok(Json(scheduler.stats().await?.into()))
}

/// GET /health
async fn health<B: Backend>(State(scheduler): State<Scheduler<B>>) -> impl IntoResponse {
    match scheduler.stats().await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") })),
        ),
        Err(error) => {
            tracing::warn!(?error, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "version": env!("CARGO_PKG_VERSION") })),
            )
        }
    }
}

/// GET /api/jobs/stream
///
/// Job updates are sent as `update` events carrying the record. Heartbeats are comments.
async fn stream_events<B: Backend>(
    State(scheduler): State<Scheduler<B>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = scheduler.subscribe().filter_map(|event| async move {
        match event {
            JobEvent::Heartbeat => Some(Event::default().comment("heartbeat")),
            JobEvent::Update { job_id, record } => Event::default()
                .event("update")
                .json_data(&record)
                .inspect_err(|error| {
                    tracing::error!(?error, %job_id, "Failed to encode job update")
                })
                .ok(),
        }
    });
    Sse::new(events.map(Ok))
}
