use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use seatwatch::{backend::BackendError, SeatWatchError};
use serde_json::json;
use thiserror::Error;

/// Errors returned by request handlers, rendered as `{ "error": ... }`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    SeatWatch(#[from] SeatWatchError),
    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::SeatWatch(
                SeatWatchError::InvalidRoute(_)
                | SeatWatchError::Plan(_)
                | SeatWatchError::InvalidSchedule(_),
            ) => StatusCode::BAD_REQUEST,
            Self::SeatWatch(SeatWatchError::JobNotFound(_))
            | Self::SeatWatch(SeatWatchError::BackendError(BackendError::JobNotFound(_))) => {
                StatusCode::NOT_FOUND
            }
            Self::SeatWatch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = ?self, "Request failed: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeDelta;
    use seatwatch::{job::JobId, route::RouteError};

    #[test]
    fn errors_map_to_status_codes() {
        let status = |error: SeatWatchError| ApiError::from(error).status();

        assert_eq!(
            status(RouteError::NoTargetTimes.into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(SeatWatchError::InvalidSchedule(TimeDelta::milliseconds(i64::MAX))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(SeatWatchError::JobNotFound(JobId::from(3))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(BackendError::BadState.into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status(BackendError::Unavailable("pool closed".to_owned()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
