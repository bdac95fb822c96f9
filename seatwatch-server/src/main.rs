use seatwatch_server::{config::AppConfig, ServerError};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().inspect_err(|error| {
        tracing::error!(?error, "Failed to load configuration: {error}");
    })?;

    seatwatch_server::run(config).await.inspect_err(|error| {
        tracing::error!(?error, "seatwatch-server stopped: {error}");
    })
}
