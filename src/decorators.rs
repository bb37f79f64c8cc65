//! Metrics decorators: cross-cutting wrappers producing `(D', E', F')`
//! (`SPEC_FULL.md` §4.5, component G).
//!
//! Each decorator intercepts `call`, records enqueue/start/complete/
//! interrupt accounting around the inner policy, and otherwise returns the
//! inner policy's result unchanged.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::CircuitBreaker;
use crate::clock::ClockHandle;
use crate::error::{BulkheadError, CircuitBreakerCallError};
use crate::metrics::MetricsHandle;
use crate::rate_limiter::RateLimiter;

/// Marks whether a decorated call reached the "started" point (the inner
/// policy began running `op`) so that a guard dropped before that point
/// can count the call as interrupted, and a guard dropped after it is a
/// no-op (completion accounting already happened in the wrapped `op`).
struct StartGuard {
    metrics: MetricsHandle,
    started: Arc<AtomicBool>,
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        if !self.started.load(Ordering::SeqCst) {
            self.metrics.record_interrupted();
        }
    }
}

/// Wraps a [`CircuitBreaker`] with enqueue/start/interrupt accounting.
pub struct MeteredCircuitBreaker<E> {
    inner: CircuitBreaker<E>,
    clock: ClockHandle,
    metrics: MetricsHandle,
}

impl<E> MeteredCircuitBreaker<E> {
    /// Wrap `inner`, recording metrics through `metrics`.
    #[must_use]
    pub fn new(inner: CircuitBreaker<E>, clock: ClockHandle, metrics: MetricsHandle) -> Self {
        Self {
            inner,
            clock,
            metrics,
        }
    }

    /// The wrapped breaker's current state.
    #[must_use]
    pub fn state(&self) -> crate::circuit_breaker::CircuitState {
        self.inner.state()
    }

    /// As [`CircuitBreaker::call`], plus the metrics accounting described
    /// in `SPEC_FULL.md` §4.5.
    pub async fn call<A, Fut>(
        &self,
        op: impl FnOnce() -> Fut,
    ) -> Result<A, CircuitBreakerCallError<E>>
    where
        Fut: Future<Output = Result<A, E>>,
    {
        let enqueue_time = self.clock.now();
        self.metrics.record_enqueued();
        let started = Arc::new(AtomicBool::new(false));
        let guard = StartGuard {
            metrics: self.metrics.clone(),
            started: started.clone(),
        };

        let metrics = self.metrics.clone();
        let clock = self.clock.clone();
        let result = self
            .inner
            .call(move || async move {
                started.store(true, Ordering::SeqCst);
                let latency_ms = clock
                    .now()
                    .saturating_duration_since(enqueue_time)
                    .as_secs_f64()
                    * 1000.0;
                metrics.record_started(latency_ms);
                let outcome = op().await;
                metrics.record_completed();
                outcome
            })
            .await;

        drop(guard);
        if matches!(result, Err(CircuitBreakerCallError::Open)) {
            self.metrics.record_rejected();
        }
        result
    }
}

/// Wraps a [`RateLimiter`] with enqueue/start/interrupt accounting.
pub struct MeteredRateLimiter {
    inner: RateLimiter,
    clock: ClockHandle,
    metrics: MetricsHandle,
}

impl MeteredRateLimiter {
    /// Wrap `inner`, recording metrics through `metrics`.
    #[must_use]
    pub fn new(inner: RateLimiter, clock: ClockHandle, metrics: MetricsHandle) -> Self {
        Self {
            inner,
            clock,
            metrics,
        }
    }

    /// As [`RateLimiter::call`], plus the metrics accounting described in
    /// `SPEC_FULL.md` §4.5.
    pub async fn call<A, Fut, E>(&self, op: impl FnOnce() -> Fut) -> Result<A, E>
    where
        Fut: Future<Output = Result<A, E>>,
    {
        let enqueue_time = self.clock.now();
        self.metrics.record_enqueued();
        let started = Arc::new(AtomicBool::new(false));
        let guard = StartGuard {
            metrics: self.metrics.clone(),
            started: started.clone(),
        };

        let metrics = self.metrics.clone();
        let clock = self.clock.clone();
        let result = self
            .inner
            .call(move || async move {
                started.store(true, Ordering::SeqCst);
                let latency_ms = clock
                    .now()
                    .saturating_duration_since(enqueue_time)
                    .as_secs_f64()
                    * 1000.0;
                metrics.record_started(latency_ms);
                let outcome = op().await;
                metrics.record_completed();
                outcome
            })
            .await;

        drop(guard);
        result
    }
}

/// Wraps a [`Bulkhead`] with enqueue/start/interrupt accounting, plus a
/// background gauge sampler that periodically appends the current in-flight
/// and queued counts to their respective histograms (`SPEC_FULL.md` §4.4,
/// "Gauges (in-flight, queued) are sampled").
pub struct MeteredBulkhead {
    inner: Arc<Bulkhead>,
    clock: ClockHandle,
    metrics: MetricsHandle,
    sampler: Option<tokio::task::JoinHandle<()>>,
    cancel: CancellationToken,
}

impl MeteredBulkhead {
    /// Wrap `inner`, recording metrics through `metrics` and sampling its
    /// in-flight/queued gauges every `gauge_sample_interval`. The sampler
    /// task is bound to this handle's lifetime: dropping it cancels the
    /// sampler.
    #[must_use]
    pub fn new(
        inner: Bulkhead,
        clock: ClockHandle,
        metrics: MetricsHandle,
        gauge_sample_interval: Duration,
    ) -> Self {
        let inner = Arc::new(inner);
        let cancel = CancellationToken::new();

        let sampler_inner = inner.clone();
        let sampler_metrics = metrics.clone();
        let sampler_clock = clock.clone();
        let sampler_cancel = cancel.clone();
        let sampler = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = sampler_clock.sleep(gauge_sample_interval) => {
                        sampler_metrics.record_in_flight_sample(sampler_inner.in_flight() as f64);
                        sampler_metrics.record_queued_sample(sampler_inner.queued() as f64);
                    }
                    () = sampler_cancel.cancelled() => return,
                }
            }
        });

        Self {
            inner,
            clock,
            metrics,
            sampler: Some(sampler),
            cancel,
        }
    }

    /// The wrapped bulkhead's current in-flight count.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight()
    }

    /// The wrapped bulkhead's current queued count.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.queued()
    }

    /// As [`Bulkhead::call`], plus the metrics accounting described in
    /// `SPEC_FULL.md` §4.5.
    pub async fn call<A, Fut, E>(&self, op: impl FnOnce() -> Fut) -> Result<A, BulkheadError<E>>
    where
        Fut: Future<Output = Result<A, E>>,
    {
        let enqueue_time = self.clock.now();
        self.metrics.record_enqueued();
        let started = Arc::new(AtomicBool::new(false));
        let guard = StartGuard {
            metrics: self.metrics.clone(),
            started: started.clone(),
        };

        let metrics = self.metrics.clone();
        let clock = self.clock.clone();
        let result = self
            .inner
            .call(move || async move {
                started.store(true, Ordering::SeqCst);
                let latency_ms = clock
                    .now()
                    .saturating_duration_since(enqueue_time)
                    .as_secs_f64()
                    * 1000.0;
                metrics.record_started(latency_ms);
                let outcome = op().await;
                metrics.record_completed();
                outcome
            })
            .await;

        drop(guard);
        if matches!(result, Err(BulkheadError::BulkheadRejection)) {
            self.metrics.record_rejected();
        }
        result
    }
}

impl Drop for MeteredBulkhead {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.sampler.take();
    }
}
