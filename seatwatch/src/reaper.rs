//! Returns deliveries held by dead workers to the queue.
use std::time::Duration;

use chrono::TimeDelta;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;

pub(crate) struct LeaseReaper<B: Backend> {
    backend: B,
    lease_timeout: TimeDelta,
    interval: Duration,
}

impl<B> LeaseReaper<B>
where
    B: Backend,
{
    pub fn new(backend: B, lease_timeout: TimeDelta, interval: Duration) -> Self {
        Self {
            backend,
            lease_timeout,
            interval,
        }
    }

    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => self.reap().await,
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the lease reaper");
                        break;
                    },
                }
            }
        })
    }

    async fn reap(&self) {
        match self.backend.requeue_expired_leases(self.lease_timeout).await {
            Ok(0) => {}
            Ok(count) => tracing::warn!(
                count,
                "Requeued {count} jobs leased for longer than {}",
                self.lease_timeout
            ),
            Err(err) => tracing::error!(?err, "Failed to requeue expired leases with error {err}"),
        }
    }
}
