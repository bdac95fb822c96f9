//! Backoff strategies used when rescheduling a probe.
//!
//! Two strategies are provided:
//!
//! 1. Constant, used for the fixed cadence between "no seats yet" attempts.
//! 2. Exponential, used after infrastructure failures.
//!
//! Either can be modified by applying [`Jitter`] and a minimum delay.
//!
//! # Example
//!
//! ```
//! # use seatwatch::backoff::*;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(2))
//!     .with_max(TimeDelta::seconds(60))
//!     .with_jitter(Jitter::Absolute(TimeDelta::seconds(1)));
//!
//! assert!(strategy.backoff(1) >= TimeDelta::seconds(1));
//! assert!(strategy.backoff(1) <= TimeDelta::seconds(3));
//! assert!(strategy.backoff(3) >= TimeDelta::seconds(7));
//! assert!(strategy.backoff(3) <= TimeDelta::seconds(9));
//! // Note the max here is the max plus max jitter
//! assert!(strategy.backoff(10) <= TimeDelta::seconds(61));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given the number of the attempt that just failed (starting at 1), returns the
    /// [`TimeDelta`] to wait before the next attempt.
    fn backoff(&self, attempt: u32) -> TimeDelta;
}

/// Constant backoff strategy.
///
/// __Note:__ This type cannot be constructed directly, instead [`BackoffStrategy::constant`]
/// should be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u32) -> TimeDelta {
        self.delay
    }
}

/// Exponential backoff strategy.
///
/// The first retry waits `base`, and each subsequent retry doubles the wait. Setting a maximum
/// with [`BackoffStrategy::with_max`] is advisable.
///
/// __Note:__ This type cannot be constructed directly, instead [`BackoffStrategy::exponential`]
/// should be used.
///
/// # Example
///
/// ```
/// # use seatwatch::backoff::*;
/// # use chrono::TimeDelta;
/// let strategy =
///     BackoffStrategy::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(30));
///
/// assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
/// assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
/// assert_eq!(strategy.backoff(3), TimeDelta::seconds(8));
/// assert_eq!(strategy.backoff(4), TimeDelta::seconds(16));
/// assert_eq!(strategy.backoff(5), TimeDelta::seconds(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let exponent = attempt.saturating_sub(1).min(62);
        let mut milliseconds = self
            .base
            .num_milliseconds()
            .checked_mul(1_i64 << exponent)
            .unwrap_or(i64::MAX);
        if let Some(max) = self.max {
            milliseconds = milliseconds.min(max.num_milliseconds());
        }
        TimeDelta::milliseconds(milliseconds)
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter to be added to the backoff in the range `-delta =< jitter =< delta`.
    Absolute(TimeDelta),
    /// A random jitter to be added as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds().abs(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round().abs() as i64,
        };
        if milliseconds == 0 {
            return value;
        }
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value + TimeDelta::milliseconds(jitter)
    }
}

/// A [`Strategy`] together with optional jitter and a lower bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy<Constant> {
    /// Creates a [`BackoffStrategy`] that always returns `delay`.
    ///
    /// ```
    /// # use seatwatch::backoff::*;
    /// # use chrono::TimeDelta;
    /// let strategy = BackoffStrategy::constant(TimeDelta::minutes(3));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::minutes(3));
    /// assert_eq!(strategy.backoff(9), TimeDelta::minutes(3));
    /// ```
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Exponential> {
    /// Creates a [`BackoffStrategy`] with an exponential backoff strategy starting at `base`.
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Clamps the maximum value to be returned by [`Strategy::backoff`] to `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    /// Creates a [`BackoffStrategy`] from a custom [`Strategy`].
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    /// Add a jitter to the backoff strategy see [`Jitter`] for more information about how this
    /// affects the strategy.
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Add a minimum value. Useful when a large jitter could otherwise produce a delay that is
    /// too short.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let mut backoff = self.strategy.backoff(attempt);

        if let Some(jitter) = self.jitter {
            backoff = jitter.apply_jitter(backoff);
        }

        backoff.max(self.min)
    }
}
