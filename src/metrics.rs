//! Windowed metrics aggregation shared by every policy's metrics decorator
//! (`SPEC_FULL.md` §4.4, component C).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::clock::ClockHandle;
use crate::histogram::{Histogram, HistogramSettings, HistogramSnapshot};

/// An immutable, addable record of one policy's metrics over a specific
/// interval (`SPEC_FULL.md` §3, "Metrics (per policy)").
///
/// `MetricsSnapshot` is a commutative monoid: `a + b` sums `interval` and
/// every counter, and adds histograms bucket-wise, which is how callers
/// fold a stream of flushed snapshots into a cumulative view.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Wall-clock span this snapshot covers.
    pub interval: Duration,
    /// Calls admitted into the policy's queue/admission path.
    pub tasks_enqueued: u64,
    /// Calls that began executing `op`.
    pub tasks_started: u64,
    /// Calls that ran `op` to completion (success or failure).
    pub tasks_completed: u64,
    /// Calls cancelled before or during execution.
    pub tasks_interrupted: u64,
    /// Calls rejected by the policy itself without running `op`.
    pub tasks_rejected: u64,
    /// Admission-to-start queue latency, one observation per started call.
    pub queue_latency: HistogramSnapshot,
    /// Periodic samples of the in-flight count (Bulkhead only; empty for
    /// policies with no gauge sampler).
    pub in_flight_gauge: HistogramSnapshot,
    /// Periodic samples of the queued count (Bulkhead only; empty for
    /// policies with no gauge sampler).
    pub queued_gauge: HistogramSnapshot,
}

impl std::ops::Add for MetricsSnapshot {
    type Output = MetricsSnapshot;

    fn add(self, rhs: Self) -> Self::Output {
        MetricsSnapshot {
            interval: self.interval + rhs.interval,
            tasks_enqueued: self.tasks_enqueued + rhs.tasks_enqueued,
            tasks_started: self.tasks_started + rhs.tasks_started,
            tasks_completed: self.tasks_completed + rhs.tasks_completed,
            tasks_interrupted: self.tasks_interrupted + rhs.tasks_interrupted,
            tasks_rejected: self.tasks_rejected + rhs.tasks_rejected,
            queue_latency: self.queue_latency + rhs.queue_latency,
            in_flight_gauge: self.in_flight_gauge + rhs.in_flight_gauge,
            queued_gauge: self.queued_gauge + rhs.queued_gauge,
        }
    }
}

/// Settings for the latency histogram every metrics aggregator carries,
/// plus the interval between background flushes.
#[derive(Debug, Clone, Copy)]
pub struct MetricsConfig {
    /// How often the background task snapshots-and-resets and emits a
    /// [`MetricsSnapshot`].
    pub metrics_interval: Duration,
    /// Bucket settings for the admission-to-start queue latency histogram,
    /// in milliseconds.
    pub queue_latency_histogram: HistogramSettings,
    /// How often the Bulkhead's gauge sampler appends an in-flight/queued
    /// observation. Ignored by policies with no gauge sampler.
    pub gauge_sample_interval: Duration,
    /// Bucket settings for the in-flight and queued gauge histograms, in
    /// call counts.
    pub gauge_histogram: HistogramSettings,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            metrics_interval: Duration::from_secs(60),
            queue_latency_histogram: HistogramSettings::new(0.1, 60_000.0),
            gauge_sample_interval: Duration::from_millis(100),
            gauge_histogram: HistogramSettings::with_bucket_count(0.0, 64.0, 16),
        }
    }
}

struct Counters {
    enqueued: crate::histogram::Counter,
    started: crate::histogram::Counter,
    completed: crate::histogram::Counter,
    interrupted: crate::histogram::Counter,
    rejected: crate::histogram::Counter,
}

impl Counters {
    fn new() -> Self {
        Self {
            enqueued: crate::histogram::Counter::new(),
            started: crate::histogram::Counter::new(),
            completed: crate::histogram::Counter::new(),
            interrupted: crate::histogram::Counter::new(),
            rejected: crate::histogram::Counter::new(),
        }
    }
}

/// Live, mutating accumulator behind a [`MetricsAggregator`]. Not exposed
/// directly; snapshots are the only externally visible view.
struct Inner {
    counters: Counters,
    queue_latency: Histogram,
    in_flight_gauge: Histogram,
    queued_gauge: Histogram,
    interval_start: AsyncMutex<tokio::time::Instant>,
}

/// A cheap, cloneable handle for recording events into a
/// [`MetricsAggregator`]'s live accumulator, the form metrics decorators
/// actually hold onto.
#[derive(Clone)]
pub struct MetricsHandle {
    inner: Arc<Inner>,
}

impl MetricsHandle {
    /// Record a newly enqueued task.
    pub fn record_enqueued(&self) {
        self.inner.counters.enqueued.incr();
    }

    /// Record a task that began executing `op`, along with the queue
    /// latency it experienced between enqueue and start.
    pub fn record_started(&self, queue_latency_ms: f64) {
        self.inner.counters.started.incr();
        self.inner.queue_latency.observe(queue_latency_ms);
    }

    /// Record a task that ran `op` to completion.
    pub fn record_completed(&self) {
        self.inner.counters.completed.incr();
    }

    /// Record a task cancelled before or during execution.
    pub fn record_interrupted(&self) {
        self.inner.counters.interrupted.incr();
    }

    /// Record a task the policy rejected outright.
    pub fn record_rejected(&self) {
        self.inner.counters.rejected.incr();
    }

    /// Append one in-flight-count sample (Bulkhead's gauge sampler).
    pub fn record_in_flight_sample(&self, count: f64) {
        self.inner.in_flight_gauge.observe(count);
    }

    /// Append one queued-count sample (Bulkhead's gauge sampler).
    pub fn record_queued_sample(&self, count: f64) {
        self.inner.queued_gauge.observe(count);
    }
}

/// Accumulates counters and a queue-latency histogram for one policy
/// instance, and drives a background task that periodically snapshots,
/// resets, and emits the result to `on_metrics`.
///
/// Constructed alongside the policy it instruments; dropping the returned
/// handle aborts the flush task, emitting one final snapshot covering the
/// trailing partial interval first.
pub struct MetricsAggregator {
    handle: MetricsHandle,
    flush_task: Option<tokio::task::JoinHandle<()>>,
    cancel: CancellationToken,
}

impl MetricsAggregator {
    /// Start a new aggregator, spawning its background flush task bound to
    /// `clock`. `on_metrics` is invoked once per `metrics_interval`, plus
    /// once more on teardown for the trailing partial interval.
    pub fn new(
        config: MetricsConfig,
        clock: ClockHandle,
        on_metrics: impl Fn(MetricsSnapshot) + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::new(Inner {
            counters: Counters::new(),
            queue_latency: Histogram::new(config.queue_latency_histogram),
            in_flight_gauge: Histogram::new(config.gauge_histogram),
            queued_gauge: Histogram::new(config.gauge_histogram),
            interval_start: AsyncMutex::new(clock.now()),
        });
        let cancel = CancellationToken::new();

        let task_inner = inner.clone();
        let task_cancel = cancel.clone();
        let task_clock = clock.clone();
        let on_metrics = Arc::new(on_metrics);
        let flush_on_metrics = on_metrics.clone();
        let flush_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = task_clock.sleep(config.metrics_interval) => {
                        let snapshot = snapshot_and_reset(&task_inner, &task_clock).await;
                        flush_on_metrics(snapshot);
                    }
                    () = task_cancel.cancelled() => {
                        let snapshot = snapshot_and_reset(&task_inner, &task_clock).await;
                        flush_on_metrics(snapshot);
                        return;
                    }
                }
            }
        });

        Self {
            handle: MetricsHandle { inner },
            flush_task: Some(flush_task),
            cancel,
        }
    }

    /// A cheap, cloneable handle for recording into this aggregator.
    #[must_use]
    pub fn handle(&self) -> MetricsHandle {
        self.handle.clone()
    }
}

impl std::ops::Deref for MetricsAggregator {
    type Target = MetricsHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

async fn snapshot_and_reset(inner: &Inner, clock: &ClockHandle) -> MetricsSnapshot {
    let now = clock.now();
    let mut interval_start = inner.interval_start.lock().await;
    let interval = now.saturating_duration_since(*interval_start);
    *interval_start = now;
    drop(interval_start);

    MetricsSnapshot {
        interval,
        tasks_enqueued: inner.counters.enqueued.snapshot_and_reset(),
        tasks_started: inner.counters.started.snapshot_and_reset(),
        tasks_completed: inner.counters.completed.snapshot_and_reset(),
        tasks_interrupted: inner.counters.interrupted.snapshot_and_reset(),
        tasks_rejected: inner.counters.rejected.snapshot_and_reset(),
        queue_latency: inner.queue_latency.snapshot_and_reset(),
        in_flight_gauge: inner.in_flight_gauge.snapshot_and_reset(),
        queued_gauge: inner.queued_gauge.snapshot_and_reset(),
    }
}

impl Drop for MetricsAggregator {
    fn drop(&mut self) {
        // Cancel rather than abort: the flush task's own cancellation
        // branch still has to run to emit the final trailing-interval
        // snapshot (SPEC_FULL.md §3, "Lifecycles"). The JoinHandle is just
        // dropped; the task keeps running to completion detached.
        self.cancel.cancel();
        self.flush_task.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::manual::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn snapshots_sum_interval_and_counters() {
        let settings = HistogramSettings::new(1.0, 100.0);
        let a = MetricsSnapshot {
            interval: Duration::from_secs(1),
            tasks_enqueued: 2,
            tasks_started: 1,
            tasks_completed: 1,
            tasks_interrupted: 0,
            tasks_rejected: 0,
            queue_latency: HistogramSnapshot::empty_like(settings),
            in_flight_gauge: HistogramSnapshot::empty_like(settings),
            queued_gauge: HistogramSnapshot::empty_like(settings),
        };
        let b = a.clone();
        let sum = a + b;
        assert_eq!(sum.interval, Duration::from_secs(2));
        assert_eq!(sum.tasks_enqueued, 4);
        assert_eq!(sum.tasks_started, 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn background_flush_emits_snapshot_per_interval() {
        let manual = ManualClock::new();
        let clock: ClockHandle = Arc::new(manual.clone());
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();

        let config = MetricsConfig {
            metrics_interval: Duration::from_secs(1),
            ..MetricsConfig::default()
        };

        let aggregator = MetricsAggregator::new(config, clock, move |_snapshot| {
            received_clone.fetch_add(1, Ordering::SeqCst);
        });
        aggregator.record_enqueued();

        manual.advance(Duration::from_secs(1));
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(received.load(Ordering::SeqCst) >= 1);
    }
}
