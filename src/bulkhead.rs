//! Bulkhead: a bounded-concurrency gate with a bounded FIFO queue
//! (`SPEC_FULL.md` §4.3).

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{BulkheadError, ConfigError};

/// Construction parameters for a [`Bulkhead`].
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct BulkheadConfig {
    /// Maximum number of concurrently in-flight calls.
    pub max_in_flight: usize,
    /// Maximum number of callers allowed to queue once `max_in_flight` is
    /// saturated; beyond this, calls are rejected immediately.
    pub max_queueing: usize,
}

impl BulkheadConfig {
    /// A config admitting `max_in_flight` concurrent calls and queueing up
    /// to `max_queueing` more.
    #[must_use]
    pub fn new(max_in_flight: usize, max_queueing: usize) -> Self {
        Self {
            max_in_flight,
            max_queueing,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::invalid("max_in_flight", "must be at least 1"));
        }
        Ok(())
    }
}

/// A bounded-concurrency gate: at most `max_in_flight` calls run at once,
/// up to `max_queueing` more wait their turn in FIFO order, and any call
/// beyond both bounds is rejected with [`BulkheadError::BulkheadRejection`]
/// instead of running `op`.
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_in_flight: usize,
    max_queueing: usize,
    queued: AtomicUsize,
}

/// A reserved queue slot, released automatically on drop (including on
/// cancellation of the call awaiting its semaphore permit).
struct QueueReservation<'a> {
    queued: &'a AtomicUsize,
}

impl Drop for QueueReservation<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Bulkhead {
    /// Construct a bulkhead, validating `config`.
    pub fn new(config: BulkheadConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_in_flight)),
            max_in_flight: config.max_in_flight,
            max_queueing: config.max_queueing,
            queued: AtomicUsize::new(0),
        })
    }

    /// Run `op` once an in-flight slot is available, or fail immediately
    /// with [`BulkheadError::BulkheadRejection`] if both the in-flight
    /// slots and the queue are saturated. `inFlight` is decremented on any
    /// termination of `op` (success, failure, or cancellation).
    pub async fn call<A, Fut, E>(&self, op: impl FnOnce() -> Fut) -> Result<A, BulkheadError<E>>
    where
        Fut: Future<Output = Result<A, E>>,
    {
        // Fast path: a permit is free right now, no queueing needed.
        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let reservation = self.reserve_queue_slot::<E>()?;
                let permit = self
                    .semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");
                drop(reservation);
                permit
            }
        };

        let result = op().await;
        drop(permit);
        result.map_err(BulkheadError::CallFailed)
    }

    fn reserve_queue_slot<E>(&self) -> Result<QueueReservation<'_>, BulkheadError<E>> {
        let mut current = self.queued.load(Ordering::SeqCst);
        loop {
            if current >= self.max_queueing {
                return Err(BulkheadError::BulkheadRejection);
            }
            match self.queued.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(QueueReservation { queued: &self.queued }),
                Err(observed) => current = observed,
            }
        }
    }

    /// Number of calls currently running `op`.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.semaphore.available_permits()
    }

    /// Number of calls currently queued, waiting for an in-flight slot.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}
