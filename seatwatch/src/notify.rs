//! Outbound "seats found" notifications.
//!
//! Delivery is fire-and-forget: a failing sink is logged and never affects the job.
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::{
    job::JobId,
    route::{RouteQuery, TimeSlotResult},
};

/// Sent once when a job completes because seats were found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatAlert {
    pub job_id: JobId,
    pub route: RouteQuery,
    pub first_found_time: Option<String>,
    pub results: Vec<TimeSlotResult>,
}

#[derive(Debug, Error)]
#[error("Failed to deliver notification: {0}")]
pub struct NotifyError(pub String);

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn seats_found(&self, alert: SeatAlert) -> Result<(), NotifyError>;
}

/// A sink that only logs alerts.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn seats_found(&self, alert: SeatAlert) -> Result<(), NotifyError> {
        tracing::info!(
            job_id = %alert.job_id,
            departure = %alert.route.departure_id,
            arrival = %alert.route.arrival_id,
            first_found_time = ?alert.first_found_time,
            "Seats found for {}",
            alert.job_id
        );
        Ok(())
    }
}
