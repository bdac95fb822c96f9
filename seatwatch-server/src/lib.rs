//! HTTP front end for seatwatch.
//!
//! Serves the job API and event stream, and runs the worker pool against an HTTP probe
//! service. Jobs are stored in Postgres when `DATABASE_URL` is set and in memory otherwise.
use seatwatch::{backend::Backend, SeatWatch, SeatWatchError};
use seatwatch_sqlx::SeatWatchPgBackend;
use thiserror::Error;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod error;
pub mod notifier;
pub mod probe;
pub mod routes;

use config::AppConfig;
use notifier::Notifier;
use probe::HttpProbe;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to load configuration: {0}")]
    Config(#[from] envy::Error),
    #[error(transparent)]
    SeatWatch(#[from] SeatWatchError),
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Picks the backend from the configuration and serves until interrupted.
pub async fn run(config: AppConfig) -> Result<(), ServerError> {
    match &config.database_url {
        Some(url) => {
            tracing::info!("Using Postgres backend");
            let backend = SeatWatchPgBackend::from_db_url(url)
                .await
                .map_err(SeatWatchError::from)?;
            backend
                .run_migrations()
                .await
                .map_err(SeatWatchError::from)?;
            serve(backend, config).await
        }
        None => {
            tracing::warn!("DATABASE_URL is not set, jobs are kept in memory");
            serve(seatwatch::backend::memory::InMemoryBackend::new(), config).await
        }
    }
}

/// Starts the workers and lease reaper on `backend` and serves the API until ctrl-c.
pub async fn serve<B: Backend>(backend: B, config: AppConfig) -> Result<(), ServerError> {
    let client = reqwest::Client::builder().build()?;
    let seatwatch = SeatWatch::new(backend)
        .with_config(config.seatwatch_config())?
        .with_workers(
            HttpProbe::new(client.clone(), config.probe_url.as_str()),
            Notifier::new(client, config.webhook_url.as_deref()),
        )?
        .with_lease_reaper();

    let app = routes::router(seatwatch.scheduler()).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Listening on {}", config.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    seatwatch.graceful_shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(?error, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
