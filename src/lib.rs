//! A small library of resilience policies for asynchronous operations
//! against a remote or otherwise-fallible resource: a Circuit Breaker, a
//! Rate Limiter, a Bulkhead, and metrics decorators that wrap any of the
//! three with windowed counters, latency histograms, and gauges.
//!
//! The three policies and the metrics layer are independent; compose them
//! by nesting calls (for example, wrap a [`circuit_breaker::CircuitBreaker`]
//! call inside a [`bulkhead::Bulkhead`] call) rather than through a generic
//! combinator, matching this crate's narrow public surface.

pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod decorators;
pub mod error;
pub mod histogram;
pub mod metrics;
pub mod rate_limiter;
pub mod schedule;

pub use bulkhead::{Bulkhead, BulkheadConfig};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use clock::{Clock, ClockHandle, TokioClock};
pub use decorators::{MeteredBulkhead, MeteredCircuitBreaker, MeteredRateLimiter};
pub use error::{BulkheadError, CircuitBreakerCallError, ConfigError};
pub use histogram::{Counter, Histogram, HistogramSettings, HistogramSnapshot};
pub use metrics::{MetricsAggregator, MetricsConfig, MetricsHandle, MetricsSnapshot};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use schedule::{ExponentialSchedule, FixedSchedule, ResetSchedule};

#[cfg(any(test, feature = "test-util"))]
pub use clock::ManualClock;
