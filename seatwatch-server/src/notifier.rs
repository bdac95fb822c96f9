use async_trait::async_trait;
use seatwatch::notify::{LogNotifier, NotificationSink, NotifyError, SeatAlert};

/// POSTs every [`SeatAlert`] as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn seats_found(&self, alert: SeatAlert) -> Result<(), NotifyError> {
        self.client
            .post(&self.url)
            .json(&alert)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| NotifyError(err.to_string()))?;
        tracing::debug!(job_id = %alert.job_id, "Delivered seat alert");
        Ok(())
    }
}

/// The sink used by the server: a webhook when one is configured, otherwise the log.
#[derive(Debug, Clone)]
pub enum Notifier {
    Webhook(WebhookNotifier),
    Log(LogNotifier),
}

impl Notifier {
    pub fn new(client: reqwest::Client, webhook_url: Option<&str>) -> Self {
        match webhook_url {
            Some(url) => Self::Webhook(WebhookNotifier::new(client, url)),
            None => Self::Log(LogNotifier),
        }
    }
}

#[async_trait]
impl NotificationSink for Notifier {
    async fn seats_found(&self, alert: SeatAlert) -> Result<(), NotifyError> {
        match self {
            Self::Webhook(webhook) => webhook.seats_found(alert).await,
            Self::Log(log) => log.seats_found(alert).await,
        }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use seatwatch::{job::JobId, route::RouteQuery};
    use tokio::sync::mpsc;

    use super::*;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{addr}/alerts")
    }

    fn alert() -> SeatAlert {
        SeatAlert {
            job_id: JobId::from(7),
            route: RouteQuery::new("010", "300", "11", "18", ["19:40"]).unwrap(),
            first_found_time: Some("19:40".to_owned()),
            results: Vec::new(),
        }
    }

    #[tokio::test]
    async fn webhook_receives_alert() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let url = serve(
            Router::new()
                .route(
                    "/alerts",
                    post(
                        |State(sender): State<mpsc::UnboundedSender<serde_json::Value>>,
                         Json(body): Json<serde_json::Value>| async move {
                            sender.send(body).unwrap();
                            StatusCode::NO_CONTENT
                        },
                    ),
                )
                .with_state(sender),
        )
        .await;

        Notifier::new(reqwest::Client::new(), Some(&url))
            .seats_found(alert())
            .await
            .unwrap();

        let body = receiver.recv().await.unwrap();
        assert_eq!(body["jobId"], 7);
        assert_eq!(body["firstFoundTime"], "19:40");
        assert_eq!(body["route"]["departureId"], "010");
    }

    #[tokio::test]
    async fn webhook_failure_is_reported() {
        let url = serve(Router::new().route(
            "/alerts",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        ))
        .await;

        let result = Notifier::new(reqwest::Client::new(), Some(&url))
            .seats_found(alert())
            .await;

        assert_matches!(result, Err(NotifyError(message)) if message.contains("500"));
    }

    #[tokio::test]
    async fn falls_back_to_log() {
        let notifier = Notifier::new(reqwest::Client::new(), None);

        assert_matches!(notifier, Notifier::Log(_));
        assert!(notifier.seats_found(alert()).await.is_ok());
    }
}
