//! Provides an in memory implementation of [`Backend`](super::Backend).
//!
//! It is not optimized, instead it is designed to be a correct implementation for use in tests
//! and single process deployments where losing state on restart is acceptable.
use std::{
    collections::BTreeMap,
    ops::Sub,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc, RwLock,
    },
};

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;

use crate::job::{
    query::JobQuery,
    state::{Transition, UpdateResult},
    JobId, JobRecord, JobStats,
};

use super::{
    queryable::{DueBy, LeasedBefore, Queryable},
    BackendError, Delivery, DeliveryStream, EnqueuableJob, JobPayload, JobQueue, JobStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum EntryState {
    Ready,
    Leased,
    Done,
    Cancelled,
}

#[derive(Debug, Clone)]
pub(super) struct QueueEntry {
    pub(super) id: JobId,
    pub(super) payload: JobPayload,
    pub(super) state: EntryState,
    pub(super) attempt: u32,
    pub(super) max_attempts: u32,
    pub(super) error_count: u32,
    pub(super) priority: u16,
    pub(super) scheduled_at: DateTime<Utc>,
    pub(super) leased_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    fn new(id: JobId, job: EnqueuableJob) -> Self {
        Self {
            id,
            payload: job.payload,
            state: EntryState::Ready,
            attempt: 0,
            max_attempts: job.max_attempts,
            error_count: 0,
            priority: job.priority,
            scheduled_at: job.scheduled_at,
            leased_at: None,
        }
    }

    fn lease(&mut self, now: DateTime<Utc>) -> Delivery {
        self.state = EntryState::Leased;
        self.leased_at = Some(now);
        self.attempt += 1;
        Delivery {
            id: self.id,
            payload: self.payload.clone(),
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            error_count: self.error_count,
            priority: self.priority,
            scheduled_at: self.scheduled_at,
        }
    }

    /// Returns a leased entry to the ready state. Withdrawn entries stay withdrawn.
    fn release(&mut self, scheduled_at: DateTime<Utc>, refund: bool) -> bool {
        if self.state != EntryState::Leased {
            return false;
        }
        if refund {
            self.attempt = self.attempt.saturating_sub(1);
        }
        self.state = EntryState::Ready;
        self.leased_at = None;
        self.scheduled_at = scheduled_at;
        true
    }
}

struct ReadyJobStream {
    backend: InMemoryBackend,
    receiver: mpsc::UnboundedReceiver<DateTime<Utc>>,
}

impl ReadyJobStream {
    const DEFAULT_DELAY: std::time::Duration = std::time::Duration::from_secs(30);
    const DELTA: std::time::Duration = std::time::Duration::from_millis(15);

    async fn next(&mut self) -> Result<Delivery, BackendError> {
        loop {
            let delay = match self.backend.next_ready_scheduled_at()? {
                Some(timestamp) => timestamp
                    .sub(Utc::now())
                    .to_std()
                    .unwrap_or(Self::DELTA)
                    .min(Self::DEFAULT_DELAY),
                _ => Self::DEFAULT_DELAY,
            };
            if delay <= Self::DELTA {
                if let Some(delivery) = self.backend.lease_next()? {
                    return Ok(delivery);
                }
            }
            tokio::select! {
                _ = self.receiver.recv() => { },
                _ = tokio::time::sleep(delay) => { },
            }
        }
    }
}

type Subscriber = mpsc::UnboundedSender<DateTime<Utc>>;

/// An in memory implementation of both [`JobQueue`] and [`JobStore`].
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    queue: Arc<RwLock<BTreeMap<JobId, QueueEntry>>>,
    records: Arc<RwLock<BTreeMap<JobId, JobRecord>>>,
    id_counter: Arc<AtomicI32>,
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    paused: Arc<AtomicBool>,
}

impl InMemoryBackend {
    /// Creates a new instance of [`InMemoryBackend`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the backend in paused mode where streams will not be woken up when entries are
    /// inserted or updated.
    ///
    /// Call [`InMemoryBackend::notify_all`] to wake them.
    pub fn paused(self) -> Self {
        self.paused.store(true, Ordering::Relaxed);
        self
    }

    /// Wake up all the stream subscribers to continue execution.
    pub fn notify_all(&self) -> Result<(), BackendError> {
        let scheduled_at = Utc::now();
        self.subscribers
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .for_each(|sender| {
                let _ = sender.send(scheduled_at);
            });
        Ok(())
    }

    fn next_ready_scheduled_at(&self) -> Result<Option<DateTime<Utc>>, BackendError> {
        Ok(self
            .queue
            .read()
            .map_err(|_| BackendError::BadState)?
            .values()
            .filter(|entry| entry.state == EntryState::Ready)
            .map(|entry| entry.scheduled_at)
            .min())
    }

    fn lease_next(&self) -> Result<Option<Delivery>, BackendError> {
        let now = Utc::now();
        let due = DueBy(now + TimeDelta::milliseconds(15));
        let mut queue = self.queue.write().map_err(|_| BackendError::BadState)?;
        Ok(queue
            .values_mut()
            .filter(|entry| due.matches(entry))
            .min_by_key(|entry| (entry.priority, entry.scheduled_at, entry.id))
            .map(|entry| entry.lease(now)))
    }

    fn notify_subscribers(&self, scheduled_at: DateTime<Utc>) -> Result<(), BackendError> {
        if !self.paused.load(Ordering::Relaxed) {
            let mut subscribers = self
                .subscribers
                .write()
                .map_err(|_| BackendError::BadState)?;
            subscribers.retain(|sender| sender.send(scheduled_at).is_ok());
        }
        Ok(())
    }

    fn with_entry<T>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut QueueEntry) -> T,
    ) -> Result<T, BackendError> {
        let mut queue = self.queue.write().map_err(|_| BackendError::BadState)?;
        queue
            .get_mut(&id)
            .map(f)
            .ok_or(BackendError::JobNotFound(id))
    }

    fn release(
        &self,
        id: JobId,
        scheduled_at: DateTime<Utc>,
        update: impl FnOnce(&mut QueueEntry),
        refund: bool,
    ) -> Result<(), BackendError> {
        let released = self.with_entry(id, |entry| {
            let leased = entry.state == EntryState::Leased;
            if leased {
                update(entry);
            }
            entry.release(scheduled_at, refund)
        })?;
        if released {
            self.notify_subscribers(scheduled_at)?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for InMemoryBackend {
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        let scheduled_at = job.scheduled_at;
        let id = JobId::from(self.id_counter.fetch_add(1, Ordering::SeqCst) + 1);

        self.queue
            .write()
            .map_err(|_| BackendError::BadState)?
            .insert(id, QueueEntry::new(id, job));

        self.notify_subscribers(scheduled_at)?;

        Ok(id)
    }

    async fn subscribe_ready_jobs(&self) -> DeliveryStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        let registered = self
            .subscribers
            .write()
            .map(|mut subscribers| subscribers.push(sender))
            .is_ok();

        let mut stream = ReadyJobStream {
            receiver,
            backend: self.clone(),
        };
        Box::pin(stream! {
            if !registered {
                yield Err(BackendError::BadState);
            }
            loop {
                yield stream.next().await;
            }
        })
    }

    async fn mark_retryable(
        &self,
        id: JobId,
        next_scheduled_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        self.release(id, next_scheduled_at, |entry| entry.error_count = 0, false)
    }

    async fn mark_errored(
        &self,
        id: JobId,
        next_scheduled_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        self.release(id, next_scheduled_at, |entry| entry.error_count += 1, true)
    }

    async fn mark_snoozed(
        &self,
        id: JobId,
        next_scheduled_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        self.release(id, next_scheduled_at, |_| {}, true)
    }

    async fn mark_done(&self, id: JobId) -> Result<(), BackendError> {
        self.with_entry(id, |entry| {
            entry.state = EntryState::Done;
            entry.leased_at = None;
        })
    }

    async fn cancel(&self, id: JobId) -> Result<(), BackendError> {
        self.with_entry(id, |entry| {
            if matches!(entry.state, EntryState::Ready | EntryState::Leased) {
                entry.state = EntryState::Cancelled;
            }
        })
    }

    async fn requeue_expired_leases(&self, lease_timeout: TimeDelta) -> Result<u64, BackendError> {
        let now = Utc::now();
        let expired = LeasedBefore(now - lease_timeout);
        let count = self
            .queue
            .write()
            .map_err(|_| BackendError::BadState)?
            .values_mut()
            .filter(|entry| expired.matches(entry))
            .map(|entry| entry.release(now, true))
            .filter(|released| *released)
            .count() as u64;
        if count > 0 {
            self.notify_subscribers(now)?;
        }
        Ok(count)
    }
}

#[async_trait]
impl JobStore for InMemoryBackend {
    async fn insert(&self, record: JobRecord) -> Result<(), BackendError> {
        let mut records = self.records.write().map_err(|_| BackendError::BadState)?;
        if records.contains_key(&record.id) {
            return Err(BackendError::AlreadyExists(record.id));
        }
        records.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, BackendError> {
        Ok(self
            .records
            .read()
            .map_err(|_| BackendError::BadState)?
            .get(&id)
            .cloned())
    }

    async fn update(
        &self,
        id: JobId,
        transition: Transition,
    ) -> Result<UpdateResult, BackendError> {
        let mut records = self.records.write().map_err(|_| BackendError::BadState)?;
        let record = records.get_mut(&id).ok_or(BackendError::JobNotFound(id))?;
        Ok(if record.apply(transition, Utc::now()) {
            UpdateResult::Applied(record.clone())
        } else {
            UpdateResult::Unchanged(record.clone())
        })
    }

    async fn list(&self, query: JobQuery) -> Result<Vec<JobRecord>, BackendError> {
        let records = self.records.read().map_err(|_| BackendError::BadState)?;
        let mut matching: Vec<_> = records
            .values()
            .filter(|record| query.matches(record))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(matching
            .into_iter()
            .skip(query.offset as usize)
            .take(query.effective_limit() as usize)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<JobStats, BackendError> {
        let records = self.records.read().map_err(|_| BackendError::BadState)?;
        Ok(records.values().fold(JobStats::default(), |mut stats, record| {
            stats.add_record(record);
            stats
        }))
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::test_suite;
    use assert_matches::assert_matches;

    test_suite!(for: InMemoryBackend::new());

    #[tokio::test]
    async fn subscribe_ready_jobs_enqueuing_does_not_wake_subscriber_when_paused() {
        let backend = InMemoryBackend::new().paused();
        let mut stream = backend.subscribe_ready_jobs().await;
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(1), stream.next()).await {
                Ok(Some(Ok(_delivery))) => panic!("Should not get woken up"),
                Err(_) => {}
                _ => panic!("Bad things happened"),
            }
        });
        tokio::task::yield_now().await;
        backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn calling_notify_all_continues_execution() {
        let backend = InMemoryBackend::new().paused();
        let mut stream = backend.subscribe_ready_jobs().await;
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(1), stream.next()).await {
                Ok(Some(Ok(delivery))) => assert_eq!(delivery.attempt, 1),
                Err(_) => panic!("Didn't get woken by notify_all"),
                _ => panic!("Bad things happened"),
            }
        });
        tokio::task::yield_now().await;
        backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        backend.notify_all().unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn badstate_errors() {
        let backend = InMemoryBackend::new();
        let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        let scheduled_at = Utc::now() + TimeDelta::days(1);

        tokio::task::spawn({
            let backend = backend.clone();
            async move {
                let _queue = backend.queue.write();
                let _records = backend.records.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(
            backend.enqueue(EnqueuableJob::mock_job()).await,
            Err(BackendError::BadState)
        );
        assert_matches!(backend.mark_done(id).await, Err(BackendError::BadState));
        assert_matches!(backend.cancel(id).await, Err(BackendError::BadState));
        assert_matches!(
            backend.mark_retryable(id, scheduled_at).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.mark_errored(id, scheduled_at).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.mark_snoozed(id, scheduled_at).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.requeue_expired_leases(TimeDelta::zero()).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.insert(JobRecord::mock()).await,
            Err(BackendError::BadState)
        );
        assert_matches!(backend.get(id).await, Err(BackendError::BadState));
        assert_matches!(
            backend.update(id, Transition::Cancel).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.list(JobQuery::all()).await,
            Err(BackendError::BadState)
        );
        assert_matches!(backend.stats().await, Err(BackendError::BadState));
    }

    #[tokio::test]
    async fn clones_share_state() {
        let backend = InMemoryBackend::new();
        let clone = backend.clone();
        let record = JobRecord::mock();

        backend.insert(record.clone()).await.unwrap();

        assert_eq!(clone.get(record.id).await.unwrap(), Some(record));
    }
}
