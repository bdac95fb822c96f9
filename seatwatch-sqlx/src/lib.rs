//! A Postgres [`JobQueue`](seatwatch::backend::JobQueue) and
//! [`JobStore`](seatwatch::backend::JobStore) for seatwatch.
//!
//! Queue entries and job records live in two tables sharing one id. Ready entries are leased
//! with `FOR UPDATE SKIP LOCKED`, and subscribers are woken through `LISTEN/NOTIFY` on the
//! `seatwatch_scheduled` channel.
//!
//! ```no_run
//! # use seatwatch_sqlx::SeatWatchPgBackend;
//! # async fn connect() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = SeatWatchPgBackend::from_db_url("postgres://localhost/seatwatch").await?;
//! backend.run_migrations().await?;
//! # Ok(())
//! # }
//! ```
use std::{ops::Deref, sync::Arc};

use chrono::{DateTime, Utc};
use seatwatch::backend::BackendError;
use sqlx::{
    migrate::Migrator,
    postgres::{PgListener, PgPoolOptions},
    PgPool,
};
use tokio::sync::{mpsc, RwLock};

mod backend;
mod query;
mod stream;
mod types;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const SCHEDULED_CHANNEL: &str = "seatwatch_scheduled";

type Subscriber = mpsc::UnboundedSender<DateTime<Utc>>;

#[derive(Clone, Debug)]
pub struct SeatWatchPgBackend {
    pool: PgPool,
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl Deref for SeatWatchPgBackend {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

fn map_err(error: sqlx::Error) -> BackendError {
    match error {
        sqlx::Error::Io(err) => BackendError::Unavailable(err.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            BackendError::Unavailable(error.to_string())
        }
        error => {
            tracing::error!(?error, "Unexpected database error: {error}");
            BackendError::BadState
        }
    }
}

impl SeatWatchPgBackend {
    /// Connects to `db_url` with a default pool.
    pub async fn from_db_url(db_url: &str) -> Result<Self, BackendError> {
        let pool = PgPoolOptions::new()
            .connect(db_url)
            .await
            .map_err(map_err)?;
        Self::from_pool(pool).await
    }

    /// Wraps `pool` and starts listening for newly ready queue entries.
    pub async fn from_pool(pool: PgPool) -> Result<Self, BackendError> {
        let this = Self {
            pool,
            subscribers: Default::default(),
        };
        let mut listener = PgListener::connect_with(&this.pool)
            .await
            .map_err(map_err)?;
        listener.listen(SCHEDULED_CHANNEL).await.map_err(map_err)?;

        tokio::spawn({
            let subscribers = this.subscribers.clone();
            async move {
                while let Ok(notification) = listener.recv().await {
                    let notification = match serde_json::from_str::<types::Notification>(
                        notification.payload(),
                    ) {
                        Ok(notification) => notification,
                        Err(error) => {
                            tracing::warn!(?error, "Ignoring malformed notification: {error}");
                            continue;
                        }
                    };
                    tracing::trace!(
                        id = notification.id,
                        "Queue entry ready at {}",
                        notification.scheduled_at
                    );
                    subscribers
                        .write()
                        .await
                        .retain(|sender| sender.send(notification.scheduled_at).is_ok());
                }
                tracing::warn!("Stopped listening on {SCHEDULED_CHANNEL}");
            }
        });

        Ok(this)
    }

    /// Applies the bundled migrations.
    pub async fn run_migrations(&self) -> Result<(), BackendError> {
        tracing::info!("Running seatwatch migrations");
        MIGRATOR.run(&self.pool).await.map_err(|error| {
            tracing::error!(?error, "Failed to run migrations: {error}");
            BackendError::Unavailable(error.to_string())
        })
    }
}
