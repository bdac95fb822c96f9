//! The seam to the external availability source.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinError;

use crate::route::{ProbeOutcome, RouteQuery};

/// Checks a route for seats.
///
/// Returning `Ok` with no seats is the normal "not yet" result. `Err`, or an outcome whose
/// `succeeded` flag is false, is an infrastructure failure that is retried with backoff.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn probe(&self, route: &RouteQuery) -> Result<ProbeOutcome, ProbeError>;
}

#[async_trait]
impl<P> Probe for Arc<P>
where
    P: Probe + ?Sized,
{
    async fn probe(&self, route: &RouteQuery) -> Result<ProbeOutcome, ProbeError> {
        self.as_ref().probe(route).await
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Could not reach the source: {0}")]
    Transport(String),
    #[error("Could not read the source response: {0}")]
    Parse(String),
    #[error("Source rejected the session: {0}")]
    Session(String),
    #[error("Probe did not finish within {0:?}")]
    Timeout(Duration),
    #[error("Probe panicked: {0}")]
    Panic(String),
    #[error("{0}")]
    Other(String),
}

impl ProbeError {
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Parse(_) => "parse",
            Self::Session(_) => "session",
            Self::Timeout(_) => "timeout",
            Self::Panic(_) => "panic",
            Self::Other(_) => "other",
        }
    }

    /// The failure reported by an outcome that ran but could not read the source.
    pub(crate) fn from_outcome(outcome: &ProbeOutcome) -> Self {
        Self::Other(
            outcome
                .error_message
                .clone()
                .unwrap_or_else(|| "Probe reported failure".to_owned()),
        )
    }
}

impl From<JoinError> for ProbeError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        match value.try_into_panic() {
            Ok(panic) => Self::Panic(
                panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or(msg),
            ),
            Err(_) => Self::Other(msg),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Utc;

    #[tokio::test]
    async fn panics_keep_their_message() {
        let error: ProbeError = tokio::spawn(async { panic!("scraper exploded") })
            .await
            .unwrap_err()
            .into();

        assert_matches!(error, ProbeError::Panic(message) if message == "scraper exploded");
    }

    #[test]
    fn failed_outcome_message() {
        let outcome = ProbeOutcome::failed("login page returned 503", Utc::now(), 40);

        assert_eq!(
            ProbeError::from_outcome(&outcome),
            ProbeError::Other("login page returned 503".to_owned())
        );
        assert_eq!(ProbeError::Timeout(Duration::from_secs(1)).error_type(), "timeout");
    }
}
