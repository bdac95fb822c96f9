//! Helpers for testing code built on seatwatch.
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    backend::JobStore,
    job::{JobId, JobRecord},
    probe::{Probe, ProbeError},
    route::{ProbeOutcome, RouteQuery, TimeSlotResult},
};

type Script = dyn Fn(usize, &RouteQuery) -> Result<ProbeOutcome, ProbeError> + Send + Sync;

/// A [`Probe`] answering from a closure of the 1-based call number.
///
/// It also tracks which jobs' routes are being probed concurrently so tests can assert that no
/// route is probed twice at the same time.
#[derive(Clone)]
pub struct ScriptedProbe {
    calls: Arc<AtomicUsize>,
    delay: Duration,
    in_flight: Arc<Mutex<HashSet<RouteQuery>>>,
    overlapped: Arc<AtomicUsize>,
    script: Arc<Script>,
}

impl ScriptedProbe {
    pub fn new(
        script: impl Fn(usize, &RouteQuery) -> Result<ProbeOutcome, ProbeError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: Default::default(),
            delay: Duration::ZERO,
            in_flight: Default::default(),
            overlapped: Default::default(),
            script: Arc::new(script),
        }
    }

    /// Never finds seats.
    pub fn no_seats() -> Self {
        Self::new(|_, route| Ok(Self::listing(route, None)))
    }

    /// Finds seats at `time` from the `attempt`th call on.
    pub fn seats_from(attempt: usize, time: &'static str) -> Self {
        Self::new(move |call, route| {
            Ok(Self::listing(route, (call >= attempt).then_some(time)))
        })
    }

    /// Always fails with a transport error.
    pub fn failing() -> Self {
        Self::new(|call, _| Err(ProbeError::Transport(format!("connection reset ({call})"))))
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of times a route was probed while another probe of it was in flight.
    pub fn overlapped(&self) -> usize {
        self.overlapped.load(Ordering::SeqCst)
    }

    /// Every target time listed without seats, except `available` when given.
    pub fn listing(route: &RouteQuery, available: Option<&str>) -> ProbeOutcome {
        let slots = route
            .target_times
            .iter()
            .map(|time| TimeSlotResult {
                time: time.clone(),
                remaining_seats_text: if Some(time.as_str()) == available { "2" } else { "0" }
                    .to_owned(),
                status_text: "listed".to_owned(),
                has_seats: Some(time.as_str()) == available,
            })
            .collect();
        ProbeOutcome::from_slots(route, slots, Utc::now(), 1)
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self, route: &RouteQuery) -> Result<ProbeOutcome, ProbeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let entered = self
            .in_flight
            .lock()
            .map(|mut in_flight| in_flight.insert(route.clone()))
            .unwrap_or(true);
        if !entered {
            self.overlapped.fetch_add(1, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if entered {
            if let Ok(mut in_flight) = self.in_flight.lock() {
                in_flight.remove(route);
            }
        }
        (self.script)(call, route)
    }
}

/// Polls `store` until the job reaches a terminal status, panicking after `within`.
pub async fn wait_for_terminal<S: JobStore>(store: &S, id: JobId, within: Duration) -> JobRecord {
    tokio::time::timeout(within, async {
        loop {
            match store.get(id).await {
                Ok(Some(record)) if record.status.is_terminal() => return record,
                Ok(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                Err(error) => panic!("Failed to read job {id}: {error}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{id} did not finish within {within:?}"))
}
