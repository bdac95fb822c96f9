use std::time::Duration;

use chrono::TimeDelta;
use chrono_tz::Tz;
use seatwatch::{
    backoff::{BackoffStrategy, Jitter},
    SeatWatchConfig,
};
use serde::Deserialize;

const PREFIX: &str = "SEATWATCH_";

/// Server settings, read from `SEATWATCH_*` environment variables.
///
/// Durations are in milliseconds. Unset tuning values keep the [`SeatWatchConfig`] defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Endpoint of the probe service that checks a route for seats.
    pub probe_url: String,

    /// Receives a POST for every job that finds seats. Alerts are only logged when unset.
    pub webhook_url: Option<String>,

    /// Postgres connection string. Jobs are kept in memory when unset.
    #[serde(skip)]
    pub database_url: Option<String>,

    pub workers: Option<usize>,
    pub rate_limit_jobs: Option<u32>,
    pub rate_limit_period_ms: Option<u64>,
    pub retry_interval_ms: Option<i64>,
    pub error_budget: Option<u32>,
    pub error_backoff_ms: Option<i64>,
    pub probe_timeout_ms: Option<u64>,
    pub heartbeat_ms: Option<u64>,
    pub lease_timeout_ms: Option<i64>,
    pub reap_interval_ms: Option<u64>,
    pub default_priority: Option<u16>,
    pub time_zone: Option<Tz>,
}

#[derive(Debug, Deserialize)]
struct DatabaseConfig {
    database_url: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

impl AppConfig {
    /// Loads `.env` if present, then reads the environment.
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        let database: DatabaseConfig = envy::from_env()?;
        Ok(Self {
            database_url: database.database_url,
            ..envy::prefixed(PREFIX).from_env()?
        })
    }

    /// The library configuration with every set value applied over the defaults.
    pub fn seatwatch_config(&self) -> SeatWatchConfig {
        let defaults = SeatWatchConfig::default();
        let mut config = defaults.clone();
        if let Some(workers) = self.workers {
            config = config.with_workers(workers);
        }
        if self.rate_limit_jobs.is_some() || self.rate_limit_period_ms.is_some() {
            config = config.with_rate_limit(
                self.rate_limit_jobs.unwrap_or(defaults.rate_limit.max_jobs),
                self.rate_limit_period_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.rate_limit.per),
            );
        }
        if let Some(interval) = self.retry_interval_ms {
            config = config.with_retry_interval(TimeDelta::milliseconds(interval));
        }
        if let Some(budget) = self.error_budget {
            config = config.with_error_budget(budget);
        }
        if let Some(base) = self.error_backoff_ms {
            config = config.with_error_backoff(
                BackoffStrategy::exponential(TimeDelta::milliseconds(base))
                    .with_max(TimeDelta::minutes(5))
                    .with_jitter(Jitter::Relative(0.1)),
            );
        }
        if let Some(timeout) = self.probe_timeout_ms {
            config = config.with_probe_timeout(Duration::from_millis(timeout));
        }
        if let Some(heartbeat) = self.heartbeat_ms {
            config = config.with_heartbeat(Duration::from_millis(heartbeat));
        }
        if let Some(timeout) = self.lease_timeout_ms {
            config = config.with_lease_timeout(TimeDelta::milliseconds(timeout));
        }
        if let Some(interval) = self.reap_interval_ms {
            config = config.with_reap_interval(Duration::from_millis(interval));
        }
        if let Some(priority) = self.default_priority {
            config = config.with_default_priority(priority);
        }
        if let Some(time_zone) = self.time_zone {
            config = config.with_time_zone(time_zone);
        }
        config
    }
}
