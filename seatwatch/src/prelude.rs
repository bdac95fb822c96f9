//! The purpose of this module is to alleviate the need to import many of the `[seatwatch]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use seatwatch::prelude::*;
//! ```
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::backoff::Strategy;
pub use crate::events::JobEvent;
pub use crate::job::builder::JobBuilder;
pub use crate::job::query::JobQuery;
pub use crate::job::{CompletionReason, JobId, JobRecord, JobStatus};
pub use crate::notify::{LogNotifier, NotificationSink, NotifyError, SeatAlert};
pub use crate::probe::{Probe, ProbeError};
pub use crate::route::{ProbeOutcome, RouteQuery, TimeSlotResult};
pub use crate::SeatWatch;
pub use crate::SeatWatchConfig;
pub use crate::SeatWatchError;
pub use crate::Scheduler;
