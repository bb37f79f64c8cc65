//! The clock and cancellation capability consumed by every policy.
//!
//! Policies never call `tokio::time::Instant::now()` or `tokio::time::sleep`
//! directly; they go through a [`Clock`] so that tests can substitute a
//! manually-advanced virtual clock instead of waiting on real wall time.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

/// Monotonic time and cancellable sleeping, the minimal capability every
/// policy needs from its host runtime.
pub trait Clock: Send + Sync + 'static {
    /// The current instant on this clock.
    fn now(&self) -> Instant;

    /// Suspend the caller until `duration` has elapsed on this clock.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// The default clock, backed by `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// A shared handle to a clock, the form every policy actually stores.
pub type ClockHandle = Arc<dyn Clock>;

/// Returns a shared handle to the default, real-time clock.
#[must_use]
pub fn tokio_clock() -> ClockHandle {
    Arc::new(TokioClock)
}

#[cfg(any(test, feature = "test-util"))]
pub mod manual {
    //! A virtual clock for deterministic scenario tests (see the scenarios
    //! in the crate's top-level documentation).

    use super::{Clock, Duration, Future, Instant, Pin};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::sync::Notify;

    /// A clock whose notion of "now" only moves when [`ManualClock::advance`]
    /// is called, used by deterministic tests of backoff and interval
    /// accounting.
    #[derive(Clone)]
    pub struct ManualClock {
        inner: Arc<Mutex<Instant>>,
        notify: Arc<Notify>,
    }

    impl ManualClock {
        /// Create a manual clock pinned at the current real instant.
        #[must_use]
        pub fn new() -> Self {
            Self {
                inner: Arc::new(Mutex::new(Instant::now())),
                notify: Arc::new(Notify::new()),
            }
        }

        /// Move this clock's notion of "now" forward by `duration`, waking
        /// any sleepers whose deadline has now passed.
        pub fn advance(&self, duration: Duration) {
            {
                let mut now = self.inner.lock();
                *now += duration;
            }
            self.notify.notify_waiters();
        }

        fn now_inner(&self) -> Instant {
            *self.inner.lock()
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.now_inner()
        }

        fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            let deadline = self.now_inner() + duration;
            Box::pin(async move {
                loop {
                    if self.now_inner() >= deadline {
                        return;
                    }
                    let notified = self.notify.notified();
                    tokio::pin!(notified);
                    if self.now_inner() >= deadline {
                        return;
                    }
                    notified.await;
                }
            })
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use manual::ManualClock;
