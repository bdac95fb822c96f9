use async_trait::async_trait;
use seatwatch::{
    probe::{Probe, ProbeError},
    route::{ProbeOutcome, RouteQuery},
};

/// Asks a probe service over HTTP.
///
/// The route is POSTed as JSON and the response body is decoded as a [`ProbeOutcome`].
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, route: &RouteQuery) -> Result<ProbeOutcome, ProbeError> {
        let response = self
            .client
            .post(&self.url)
            .json(route)
            .send()
            .await
            .map_err(|err| ProbeError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProbeError::Transport(format!(
                "probe service returned {status}: {body}"
            )));
        }

        response
            .json::<ProbeOutcome>()
            .await
            .map_err(|err| ProbeError::Parse(err.to_string()))
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use chrono::Utc;
    use seatwatch::route::TimeSlotResult;

    use super::*;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{addr}/check")
    }

    fn route() -> RouteQuery {
        RouteQuery::new("010", "300", "11", "18", ["18:40", "19:40"]).unwrap()
    }

    #[tokio::test]
    async fn decodes_outcome() {
        let url = serve(Router::new().route(
            "/check",
            post(|Json(route): Json<RouteQuery>| async move {
                let listed = vec![TimeSlotResult {
                    time: "19:40".to_owned(),
                    remaining_seats_text: "3석".to_owned(),
                    status_text: "예매가능".to_owned(),
                    has_seats: true,
                }];
                Json(ProbeOutcome::from_slots(&route, listed, Utc::now(), 12))
            }),
        ))
        .await;

        let outcome = HttpProbe::new(reqwest::Client::new(), url)
            .probe(&route())
            .await
            .unwrap();

        assert!(outcome.found_seats);
        assert_eq!(outcome.first_found_time.as_deref(), Some("19:40"));
        assert_eq!(outcome.results.len(), 2);
        assert!(!outcome.results[0].has_seats);
    }

    #[tokio::test]
    async fn error_status_is_transport_error() {
        let url = serve(Router::new().route(
            "/check",
            post(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
        ))
        .await;

        let result = HttpProbe::new(reqwest::Client::new(), url)
            .probe(&route())
            .await;

        assert_matches!(result, Err(ProbeError::Transport(message)) if message.contains("502"));
    }

    #[tokio::test]
    async fn malformed_body_is_parse_error() {
        let url = serve(Router::new().route("/check", post(|| async { "<html>" }))).await;

        let result = HttpProbe::new(reqwest::Client::new(), url)
            .probe(&route())
            .await;

        assert_matches!(result, Err(ProbeError::Parse(_)));
    }

    #[tokio::test]
    async fn unreachable_service_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = HttpProbe::new(reqwest::Client::new(), format!("http://{addr}/check"))
            .probe(&route())
            .await;

        assert_matches!(result, Err(ProbeError::Transport(_)));
    }
}
