//! In-process fan-out of job state changes with a periodic heartbeat.
use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::job::{JobId, JobRecord};

/// A frame delivered to event stream listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobEvent {
    #[serde(rename_all = "camelCase")]
    Update { job_id: JobId, record: JobRecord },
    Heartbeat,
}

/// Broadcasts [`JobEvent::Update`]s to every subscriber.
///
/// Publishing never blocks or fails. A subscriber that falls more than `capacity` events behind
/// skips the missed events.
#[derive(Debug, Clone)]
pub struct EventNotifier {
    sender: broadcast::Sender<JobEvent>,
    heartbeat: Duration,
}

impl EventNotifier {
    pub const DEFAULT_CAPACITY: usize = 256;
    pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

    pub fn new(capacity: usize, heartbeat: Duration) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, heartbeat }
    }

    pub fn publish(&self, record: &JobRecord) {
        let receivers = self
            .sender
            .send(JobEvent::Update {
                job_id: record.id,
                record: record.clone(),
            })
            .unwrap_or(0);
        tracing::trace!(job_id = %record.id, receivers, "Published job update");
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// A stream of updates interleaved with a heartbeat every configured interval.
    ///
    /// The first heartbeat is sent one interval after subscribing.
    pub fn subscribe(&self) -> impl Stream<Item = JobEvent> + Send + 'static {
        let mut receiver = self.sender.subscribe();
        let period = self.heartbeat;
        stream! {
            let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let event = tokio::select! {
                    event = receiver.recv() => match event {
                        Ok(event) => Some(event),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Event subscriber lagged, skipping events");
                            None
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = heartbeat.tick() => Some(JobEvent::Heartbeat),
                };
                if let Some(event) = event {
                    yield event;
                }
            }
        }
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY, Self::DEFAULT_HEARTBEAT)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let notifier = EventNotifier::default();

        notifier.publish(&JobRecord::mock());

        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_updates() {
        let notifier = EventNotifier::default();
        let first = notifier.subscribe();
        let second = notifier.subscribe();
        tokio::pin!(first, second);
        let record = JobRecord::mock();

        notifier.publish(&record);

        let expected = JobEvent::Update {
            job_id: record.id,
            record,
        };
        assert_eq!(first.next().await, Some(expected.clone()));
        assert_eq!(second.next().await, Some(expected));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_is_emitted_periodically() {
        let notifier = EventNotifier::new(8, Duration::from_secs(30));
        let events = notifier.subscribe();
        tokio::pin!(events);

        assert_eq!(events.next().await, Some(JobEvent::Heartbeat));
        assert_eq!(events.next().await, Some(JobEvent::Heartbeat));
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_ahead() {
        let notifier = EventNotifier::new(2, Duration::from_secs(3600));
        let events = notifier.subscribe();
        tokio::pin!(events);
        let records: Vec<_> = (1..=5)
            .map(|id| JobRecord {
                id: id.into(),
                ..JobRecord::mock()
            })
            .collect();

        records.iter().for_each(|record| notifier.publish(record));

        assert_eq!(
            events.next().await,
            Some(JobEvent::Update {
                job_id: records[3].id,
                record: records[3].clone(),
            })
        );
    }

    #[test]
    fn heartbeat_serializes_with_type_tag() {
        assert_eq!(
            serde_json::to_value(JobEvent::Heartbeat).unwrap(),
            serde_json::json!({ "type": "heartbeat" })
        );
    }
}
