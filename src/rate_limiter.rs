//! Rate limiter: paces calls to at most `max` permits per sliding
//! `interval` (`SPEC_FULL.md` §4.2).

use std::collections::VecDeque;
use std::future::Future;

use tokio::sync::Mutex;

use crate::clock::ClockHandle;
use crate::error::ConfigError;

/// Construction parameters for a [`RateLimiter`].
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct RateLimiterConfig {
    /// Maximum permits issued within any rolling window of `interval`.
    pub max: usize,
    /// Width of the rolling window, in milliseconds.
    #[serde(with = "duration_millis")]
    pub interval: std::time::Duration,
}

impl RateLimiterConfig {
    /// A config issuing `max` permits per `interval`.
    #[must_use]
    pub fn new(max: usize, interval: std::time::Duration) -> Self {
        Self { max, interval }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max == 0 {
            return Err(ConfigError::invalid("max", "must be at least 1"));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::invalid("interval", "must be greater than zero"));
        }
        Ok(())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// An admission controller pacing calls to at most `max` permits per
/// sliding `interval`.
///
/// Fairness is obtained by holding a FIFO-fair [`tokio::sync::Mutex`]
/// across the wait for the next permit instant: the next queued caller's
/// `lock().await` only resolves once the current head releases the guard,
/// which happens exactly when that caller's permit has been issued
/// (`SPEC_FULL.md` §9 and the primitive-choice note in §5).
pub struct RateLimiter {
    clock: ClockHandle,
    max: usize,
    interval: std::time::Duration,
    issuances: Mutex<VecDeque<tokio::time::Instant>>,
}

impl RateLimiter {
    /// Construct a rate limiter, validating `config`.
    pub fn new(config: RateLimiterConfig, clock: ClockHandle) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            clock,
            max: config.max,
            interval: config.interval,
            issuances: Mutex::new(VecDeque::with_capacity(config.max)),
        })
    }

    /// Wait for a permit (FIFO order among concurrent callers), then run
    /// `op`. The error type is untouched: the limiter never fabricates an
    /// error and never rejects a caller, only delays them.
    pub async fn call<A, Fut, E>(&self, op: impl FnOnce() -> Fut) -> Result<A, E>
    where
        Fut: Future<Output = Result<A, E>>,
    {
        self.acquire().await;
        op().await
    }

    /// Block until a permit is available, recording its issuance. Holding
    /// the mutex guard across `clock.sleep` is what gives this FIFO
    /// fairness; dropping this future before it resolves (cancellation)
    /// releases the mutex without issuing a permit.
    async fn acquire(&self) {
        let mut issuances = self.issuances.lock().await;
        loop {
            let now = self.clock.now();
            if issuances.len() < self.max {
                issuances.push_back(now);
                return;
            }
            let oldest = *issuances.front().expect("len >= max > 0 implies non-empty");
            if now.saturating_duration_since(oldest) >= self.interval {
                issuances.pop_front();
                issuances.push_back(now);
                return;
            }
            let wait_until = oldest + self.interval;
            self.clock
                .sleep(wait_until.saturating_duration_since(now))
                .await;
        }
    }

    /// Permits currently recorded in the issuance ring, for tests and
    /// metrics decorators.
    #[cfg(test)]
    async fn issued_count(&self) -> usize {
        self.issuances.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::manual::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn rejects_zero_max() {
        let config = RateLimiterConfig::new(0, Duration::from_secs(1));
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn rejects_zero_interval() {
        let config = RateLimiterConfig::new(5, Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn issues_up_to_max_immediately() {
        let clock: ClockHandle = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(RateLimiterConfig::new(5, Duration::from_secs(1)), clock)
            .expect("valid config");

        for _ in 0..5 {
            limiter.call(|| async { Ok::<_, ()>(()) }).await.unwrap();
        }
        assert_eq!(limiter.issued_count().await, 5);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn throughput_partitions_into_windows() {
        let manual = ManualClock::new();
        let clock: ClockHandle = Arc::new(manual.clone());
        let limiter = Arc::new(
            RateLimiter::new(RateLimiterConfig::new(5, Duration::from_secs(1)), clock)
                .expect("valid config"),
        );

        let starts = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            let starts = starts.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .call(|| {
                        let starts = starts.clone();
                        async move {
                            starts.lock().push(tokio::time::Instant::now());
                            Ok::<_, ()>(())
                        }
                    })
                    .await
                    .unwrap();
            }));
        }

        // Drive the virtual clock forward in small steps so queued waiters
        // that are ready can make progress.
        for _ in 0..4 {
            tokio::task::yield_now().await;
            manual.advance(Duration::from_secs(1));
            for _ in 0..50 {
                tokio::task::yield_now().await;
            }
        }
        for handle in handles {
            let _ = handle.await;
        }

        let mut starts = starts.lock().clone();
        starts.sort();
        assert_eq!(starts.len(), 20);
        // Bucket consecutive starts: each run of <=5 within the same
        // window must be spaced >= 1s from the previous window's start.
        let first = starts[0];
        let bucket_of = |t: tokio::time::Instant| {
            t.saturating_duration_since(first).as_millis() / 1000
        };
        let mut counts = std::collections::BTreeMap::new();
        for t in &starts {
            *counts.entry(bucket_of(*t)).or_insert(0) += 1;
        }
        for count in counts.values() {
            assert!(*count <= 5, "no window may exceed max permits");
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn cancelled_waiter_does_not_consume_a_permit() {
        let manual = ManualClock::new();
        let clock: ClockHandle = Arc::new(manual.clone());
        let limiter = Arc::new(
            RateLimiter::new(RateLimiterConfig::new(1, Duration::from_secs(1)), clock)
                .expect("valid config"),
        );

        limiter.call(|| async { Ok::<_, ()>(()) }).await.unwrap();
        assert_eq!(limiter.issued_count().await, 1);

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter.call(|| async { Ok::<_, ()>(()) }).await.unwrap();
            })
        };
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;

        // The aborted waiter must not have left a phantom issuance behind;
        // a fresh call still only needs to wait out the first permit.
        manual.advance(Duration::from_secs(1));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        limiter.call(|| async { Ok::<_, ()>(()) }).await.unwrap();
    }
}
