//! The Circuit Breaker's reset schedule abstraction (`SPEC_FULL.md` §4.1,
//! §9 "Schedule abstraction").
//!
//! `resetPolicy` is modelled as a stateful iterator: each call to
//! [`ResetSchedule::advance`] both returns the delay to sleep before the
//! next `HalfOpen` probe and mutates the cursor so the next call returns a
//! larger delay. [`ResetSchedule::reset`] rewinds the cursor to its initial
//! value, invoked when the breaker returns to `Closed`.

use std::time::Duration;

/// A lazy sequence of positive durations driving the Circuit Breaker's
/// `Open -> HalfOpen` backoff. Implementations must never hard-code a
/// single shape (exponential, fixed, ...); the breaker only depends on
/// this trait.
pub trait ResetSchedule: Send {
    /// Advance the cursor by one step and return the delay to wait before
    /// the next reset attempt.
    fn advance(&mut self) -> Duration;

    /// Rewind the cursor to its initial state, so the next trip restarts
    /// from the base delay.
    fn reset(&mut self);
}

/// The reference schedule: `base, base*factor, base*factor^2, ...`,
/// optionally clamped to `max`.
#[derive(Debug, Clone)]
pub struct ExponentialSchedule {
    base: Duration,
    factor: f64,
    max: Option<Duration>,
    next: Duration,
}

impl ExponentialSchedule {
    /// A schedule starting at `base` and multiplying by `factor` on every
    /// `advance`, uncapped.
    #[must_use]
    pub fn new(base: Duration, factor: f64) -> Self {
        Self {
            base,
            factor,
            max: None,
            next: base,
        }
    }

    /// As [`ExponentialSchedule::new`], but delays never exceed `max`.
    #[must_use]
    pub fn with_max(base: Duration, factor: f64, max: Duration) -> Self {
        Self {
            base,
            factor,
            max: Some(max),
            next: base,
        }
    }
}

impl ResetSchedule for ExponentialSchedule {
    fn advance(&mut self) -> Duration {
        let delay = self.next;
        let scaled = self.next.mul_f64(self.factor);
        self.next = match self.max {
            Some(max) if scaled > max => max,
            _ => scaled,
        };
        delay
    }

    fn reset(&mut self) {
        self.next = self.base;
    }
}

/// A schedule that always returns the same delay; useful for tests and for
/// callers who do not want backoff growth.
#[derive(Debug, Clone, Copy)]
pub struct FixedSchedule(pub Duration);

impl ResetSchedule for FixedSchedule {
    fn advance(&mut self) -> Duration {
        self.0
    }

    fn reset(&mut self) {}
}
