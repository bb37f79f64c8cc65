//! Bounded-bucket histogram and monotone counter primitives (`SPEC_FULL.md`
//! §4.4, component B).
//!
//! Bucket edges are derived once, eagerly, from [`HistogramSettings`] and
//! never recomputed; every [`Histogram`] built from the same settings has
//! identical edges, which is what makes bucket-wise addition between two
//! histograms well-defined.

use std::sync::atomic::{AtomicU64, Ordering};

/// The construction parameters for a log-scaled histogram.
///
/// Buckets are log-spaced across `[min, max]`; an observation below `min`
/// or above `max` is clamped to the first or last bucket respectively, so
/// every observation lands somewhere and addition stays total.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramSettings {
    /// Lower edge of the first bucket (exclusive below this, observations
    /// clamp in).
    pub min: f64,
    /// Upper edge of the last bucket (inclusive above this, observations
    /// clamp in).
    pub max: f64,
    /// Number of buckets; defaults to 16 when not given.
    pub bucket_count: Option<usize>,
}

const DEFAULT_BUCKET_COUNT: usize = 16;

impl HistogramSettings {
    /// Construct settings for a histogram over `[min, max]` with the
    /// default bucket count.
    #[must_use]
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            bucket_count: None,
        }
    }

    /// Construct settings for a histogram over `[min, max]` with an
    /// explicit bucket count.
    #[must_use]
    pub fn with_bucket_count(min: f64, max: f64, bucket_count: usize) -> Self {
        Self {
            min,
            max,
            bucket_count: Some(bucket_count),
        }
    }

    fn bucket_count(&self) -> usize {
        self.bucket_count.unwrap_or(DEFAULT_BUCKET_COUNT).max(1)
    }

    /// Edges derived eagerly: `edges[i]` is the upper (inclusive) bound of
    /// bucket `i`. Log-spaced between `min.max(f64::MIN_POSITIVE)` and
    /// `max`.
    fn edges(&self) -> Vec<f64> {
        let count = self.bucket_count();
        let lo = self.min.max(f64::MIN_POSITIVE).ln();
        let hi = self.max.max(self.min.max(f64::MIN_POSITIVE) * 2.0).ln();
        let step = (hi - lo) / count as f64;
        (1..=count)
            .map(|i| {
                if i == count {
                    f64::INFINITY
                } else {
                    (lo + step * i as f64).exp()
                }
            })
            .collect()
    }
}

/// A fixed-bucket histogram with atomic per-bucket counters, addable with
/// another histogram built from the same [`HistogramSettings`].
#[derive(Debug)]
pub struct Histogram {
    edges: Vec<f64>,
    buckets: Vec<AtomicU64>,
}

impl Histogram {
    /// Build an empty histogram from `settings`.
    #[must_use]
    pub fn new(settings: HistogramSettings) -> Self {
        let edges = settings.edges();
        let buckets = (0..edges.len()).map(|_| AtomicU64::new(0)).collect();
        Self { edges, buckets }
    }

    /// Record one observation, clamped into `[first bucket, last bucket]`.
    pub fn observe(&self, value: f64) {
        let idx = self.bucket_index(value);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    fn bucket_index(&self, value: f64) -> usize {
        self.edges
            .iter()
            .position(|&edge| value <= edge)
            .unwrap_or(self.edges.len() - 1)
    }

    /// Snapshot the current bucket counts without resetting them.
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            edges: self.edges.clone(),
            counts: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
        }
    }

    /// Atomically read the current counts and zero every bucket.
    #[must_use]
    pub fn snapshot_and_reset(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            edges: self.edges.clone(),
            counts: self
                .buckets
                .iter()
                .map(|b| b.swap(0, Ordering::Relaxed))
                .collect(),
        }
    }
}

/// An immutable, addable record of one histogram's bucket counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramSnapshot {
    edges: Vec<f64>,
    counts: Vec<u64>,
}

impl HistogramSnapshot {
    /// An all-zero snapshot over `edges`, the identity of `+`.
    #[must_use]
    pub fn empty_like(settings: HistogramSettings) -> Self {
        let edges = settings.edges();
        let counts = vec![0; edges.len()];
        Self { edges, counts }
    }

    /// Total observations across all buckets.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// The raw `(upper_edge, count)` pairs, in bucket order.
    #[must_use]
    pub fn buckets(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
        self.edges.iter().copied().zip(self.counts.iter().copied())
    }
}

impl std::ops::Add for HistogramSnapshot {
    type Output = HistogramSnapshot;

    fn add(self, rhs: Self) -> Self::Output {
        debug_assert_eq!(
            self.edges, rhs.edges,
            "histogram snapshots must share bucket edges to be addable"
        );
        let counts = self
            .counts
            .iter()
            .zip(rhs.counts.iter())
            .map(|(a, b)| a + b)
            .collect();
        HistogramSnapshot {
            edges: self.edges,
            counts,
        }
    }
}

/// A plain monotone counter, the unit of `SPEC_FULL.md` §4.4's "plain
/// atomic increments".
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// A counter starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increment by one.
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset to zero.
    pub fn snapshot_and_reset(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observations_clamp_to_edge_buckets() {
        let settings = HistogramSettings::with_bucket_count(1.0, 100.0, 4);
        let hist = Histogram::new(settings);

        hist.observe(0.0001); // below min, clamps to first bucket
        hist.observe(1_000_000.0); // above max, clamps to last bucket

        let snap = hist.snapshot();
        let counts: Vec<u64> = snap.buckets().map(|(_, c)| c).collect();
        assert_eq!(counts.first().copied(), Some(1));
        assert_eq!(counts.last().copied(), Some(1));
        assert_eq!(snap.total(), 2);
    }

    #[test]
    fn snapshots_from_same_settings_add_bucket_wise() {
        let settings = HistogramSettings::with_bucket_count(1.0, 100.0, 4);
        let a = Histogram::new(settings);
        let b = Histogram::new(settings);

        a.observe(2.0);
        b.observe(2.0);
        b.observe(50.0);

        let sum = a.snapshot() + b.snapshot();
        assert_eq!(sum.total(), 3);
    }

    #[test]
    fn snapshot_and_reset_zeroes_buckets() {
        let settings = HistogramSettings::new(1.0, 10.0);
        let hist = Histogram::new(settings);
        hist.observe(5.0);
        let first = hist.snapshot_and_reset();
        assert_eq!(first.total(), 1);
        let second = hist.snapshot();
        assert_eq!(second.total(), 0);
    }

    #[test]
    fn counter_increments_and_resets() {
        let counter = Counter::new();
        counter.incr();
        counter.incr();
        assert_eq!(counter.snapshot_and_reset(), 2);
        assert_eq!(counter.snapshot_and_reset(), 0);
    }
}
