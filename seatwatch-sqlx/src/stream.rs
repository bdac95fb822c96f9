use std::ops::Sub;

use chrono::{DateTime, Utc};
use seatwatch::backend::{BackendError, Delivery};

use crate::{map_err, SeatWatchPgBackend};

pub(crate) struct ReadyJobStream {
    pub(crate) backend: SeatWatchPgBackend,
    pub(crate) receiver: tokio::sync::mpsc::UnboundedReceiver<DateTime<Utc>>,
}

impl ReadyJobStream {
    const DEFAULT_DELAY: std::time::Duration = std::time::Duration::from_secs(30);
    const DELTA: std::time::Duration = std::time::Duration::from_millis(15);

    pub(crate) async fn next(&mut self) -> Result<Delivery, BackendError> {
        loop {
            let delay = match self
                .backend
                .next_ready_scheduled_at()
                .await
                .map_err(map_err)?
            {
                Some(timestamp) => timestamp
                    .sub(Utc::now())
                    .to_std()
                    .unwrap_or(Self::DELTA)
                    .min(Self::DEFAULT_DELAY),
                _ => Self::DEFAULT_DELAY,
            };
            if delay <= Self::DELTA {
                if let Some(entry) = self
                    .backend
                    .lease_next(Utc::now() + Self::DELTA)
                    .await
                    .map_err(map_err)?
                {
                    return entry.try_into();
                }
            }
            tokio::select! {
                _ = self.receiver.recv() => { },
                _ = tokio::time::sleep(delay) => { },
            }
        }
    }
}
