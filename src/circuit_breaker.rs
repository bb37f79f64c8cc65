//! Circuit breaker: a three-state failure detector (`SPEC_FULL.md` §4.1).

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::ClockHandle;
use crate::error::{CircuitBreakerCallError, ConfigError};
use crate::schedule::ResetSchedule;

/// The breaker's three states (`SPEC_FULL.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls run normally; failures accumulate toward `max_failures`.
    Closed,
    /// Calls are rejected outright; a reset task is waiting to probe.
    Open,
    /// Exactly one call may probe the backend; its result decides the next
    /// transition.
    HalfOpen,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

fn state_from_u8(v: u8) -> CircuitState {
    match v {
        STATE_CLOSED => CircuitState::Closed,
        STATE_OPEN => CircuitState::Open,
        STATE_HALF_OPEN => CircuitState::HalfOpen,
        _ => unreachable!("circuit breaker state byte out of range"),
    }
}

/// Construction parameters for a [`CircuitBreaker`].
pub struct CircuitBreakerConfig<E> {
    /// Consecutive `Closed`-state failures before tripping to `Open`.
    pub max_failures: usize,
    /// The reset backoff schedule (see [`crate::schedule`]).
    pub reset_schedule: Box<dyn ResetSchedule>,
    /// Classifies an `op` error as countable against the breaker. Defaults
    /// to "every error counts" when not set (`SPEC_FULL.md` §4.1 / §9 open
    /// question).
    pub is_failure: Option<Arc<dyn Fn(&E) -> bool + Send + Sync>>,
}

impl<E> CircuitBreakerConfig<E> {
    /// A config with `max_failures` and `reset_schedule`, every error
    /// counting as a failure.
    pub fn new(max_failures: usize, reset_schedule: impl ResetSchedule + 'static) -> Self {
        Self {
            max_failures,
            reset_schedule: Box::new(reset_schedule),
            is_failure: None,
        }
    }

    /// Only errors for which `predicate` returns `true` count toward
    /// `max_failures`.
    #[must_use]
    pub fn is_failure(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.is_failure = Some(Arc::new(predicate));
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_failures == 0 {
            return Err(ConfigError::invalid(
                "max_failures",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

struct Shared {
    state: AtomicU8,
    failure_count: AtomicUsize,
    half_open_gate: AtomicBool,
}

/// A three-state failure detector wrapping calls to a fallible resource.
///
/// Construction spawns a background reset task bound to this breaker's
/// lifetime; dropping the breaker cancels it, per `SPEC_FULL.md` §3
/// "Lifecycles".
pub struct CircuitBreaker<E> {
    shared: Arc<Shared>,
    schedule: Arc<Mutex<Box<dyn ResetSchedule>>>,
    max_failures: usize,
    is_failure: Option<Arc<dyn Fn(&E) -> bool + Send + Sync>>,
    on_state_change: Arc<dyn Fn(CircuitState) + Send + Sync>,
    reset_requests: mpsc::Sender<()>,
    reset_task: Option<tokio::task::JoinHandle<()>>,
}

impl<E> CircuitBreaker<E> {
    /// Construct a breaker, validating `config` and spawning its
    /// background reset task on `clock`. `on_state_change` fires exactly
    /// once per transition, after the state mutation is visible, never
    /// while holding the breaker's internal lock (`SPEC_FULL.md` §9
    /// "Callback re-entrance").
    pub fn new(
        config: CircuitBreakerConfig<E>,
        clock: ClockHandle,
        on_state_change: impl Fn(CircuitState) + Send + Sync + 'static,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let shared = Arc::new(Shared {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicUsize::new(0),
            half_open_gate: AtomicBool::new(true),
        });
        let schedule = Arc::new(Mutex::new(config.reset_schedule));
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let on_state_change = Arc::new(on_state_change);

        let task_shared = shared.clone();
        let task_schedule = schedule.clone();
        let task_clock = clock.clone();
        let task_on_state_change = on_state_change.clone();
        let reset_task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let delay = task_schedule.lock().advance();
                debug!(?delay, "circuit breaker scheduling reset probe");
                task_clock.sleep(delay).await;

                task_shared.half_open_gate.store(true, Ordering::SeqCst);
                task_shared.state.store(STATE_HALF_OPEN, Ordering::SeqCst);
                info!("circuit breaker transition: Open -> HalfOpen");
                task_on_state_change(CircuitState::HalfOpen);
            }
        });

        Ok(Self {
            shared,
            schedule,
            max_failures: config.max_failures,
            is_failure: config.is_failure,
            on_state_change,
            reset_requests: tx,
            reset_task: Some(reset_task),
        })
    }

    /// The breaker's current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        state_from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// Run `op` subject to the breaker's admission rules.
    ///
    /// `Closed`: runs `op`; `HalfOpen`: runs `op` only if this call wins
    /// the atomic test-and-clear of the probe gate; `Open`: rejects
    /// without running `op`.
    pub async fn call<A, Fut>(
        &self,
        op: impl FnOnce() -> Fut,
    ) -> Result<A, CircuitBreakerCallError<E>>
    where
        Fut: Future<Output = Result<A, E>>,
    {
        match self.state() {
            CircuitState::Open => Err(CircuitBreakerCallError::Open),
            CircuitState::HalfOpen => {
                if self
                    .shared
                    .half_open_gate
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return Err(CircuitBreakerCallError::Open);
                }
                self.run_admitted(op).await
            }
            CircuitState::Closed => self.run_admitted(op).await,
        }
    }

    async fn run_admitted<A, Fut>(
        &self,
        op: impl FnOnce() -> Fut,
    ) -> Result<A, CircuitBreakerCallError<E>>
    where
        Fut: Future<Output = Result<A, E>>,
    {
        let was_half_open = self.state() == CircuitState::HalfOpen;
        match op().await {
            Ok(value) => {
                if was_half_open {
                    self.on_half_open_success();
                } else {
                    self.shared.failure_count.store(0, Ordering::SeqCst);
                }
                Ok(value)
            }
            Err(err) => {
                let counts = self.is_failure.as_ref().is_none_or(|f| f(&err));
                if counts {
                    if was_half_open {
                        self.on_half_open_failure();
                    } else {
                        self.on_closed_failure();
                    }
                }
                Err(CircuitBreakerCallError::Wrapped(err))
            }
        }
    }

    fn on_closed_failure(&self) {
        let prev = self.shared.failure_count.fetch_add(1, Ordering::SeqCst);
        let count = prev + 1;
        if count >= self.trip_threshold() {
            let won = self
                .shared
                .state
                .compare_exchange(
                    STATE_CLOSED,
                    STATE_OPEN,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok();
            if won {
                warn!(failures = count, "circuit breaker transition: Closed -> Open");
                self.post_reset_request();
                (self.on_state_change)(CircuitState::Open);
            }
        }
    }

    fn on_half_open_failure(&self) {
        self.shared.state.store(STATE_OPEN, Ordering::SeqCst);
        warn!("circuit breaker transition: HalfOpen -> Open");
        self.post_reset_request();
        (self.on_state_change)(CircuitState::Open);
    }

    fn on_half_open_success(&self) {
        self.shared.failure_count.store(0, Ordering::SeqCst);
        self.schedule.lock().reset();
        self.shared.state.store(STATE_CLOSED, Ordering::SeqCst);
        info!("circuit breaker transition: HalfOpen -> Closed");
        (self.on_state_change)(CircuitState::Closed);
    }

    fn trip_threshold(&self) -> usize {
        self.max_failures
    }

    fn post_reset_request(&self) {
        // Single-slot mailbox: a full channel means a reset is already
        // pending, so the extra offer is dropped (SPEC_FULL.md §9).
        let _ = self.reset_requests.try_send(());
    }
}

impl<E> Drop for CircuitBreaker<E> {
    fn drop(&mut self) {
        if let Some(task) = self.reset_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::manual::ManualClock;
    use crate::schedule::ExponentialSchedule;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn breaker_with_states(
        max_failures: usize,
        clock: ClockHandle,
    ) -> (CircuitBreaker<&'static str>, Arc<StdMutex<Vec<CircuitState>>>) {
        let states = Arc::new(StdMutex::new(Vec::new()));
        let states_clone = states.clone();
        let config = CircuitBreakerConfig::new(
            max_failures,
            ExponentialSchedule::new(Duration::from_secs(1), 2.0),
        );
        let breaker = CircuitBreaker::new(config, clock, move |state| {
            states_clone.lock().unwrap().push(state);
        })
        .expect("valid config");
        (breaker, states)
    }

    async fn fail(breaker: &CircuitBreaker<&'static str>) -> Result<(), CircuitBreakerCallError<&'static str>> {
        breaker.call(|| async { Err::<(), _>("boom") }).await
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn closed_to_open_trip() {
        let clock: ClockHandle = Arc::new(ManualClock::new());
        let (breaker, _states) = breaker_with_states(10, clock);

        for _ in 0..10 {
            let result = fail(&breaker).await;
            assert!(matches!(result, Err(CircuitBreakerCallError::Wrapped("boom"))));
        }

        let eleventh = fail(&breaker).await;
        assert!(matches!(eleventh, Err(CircuitBreakerCallError::Open)));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn open_to_half_open_to_closed_probe() {
        let manual = ManualClock::new();
        let clock: ClockHandle = Arc::new(manual.clone());
        let (breaker, states) = breaker_with_states(10, clock);

        for _ in 0..10 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        manual.advance(Duration::from_secs(1));
        // Let the reset task's sleep resolve and the transition land.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let probe = breaker.call(|| async { Ok::<_, &'static str>(()) }).await;
        assert!(probe.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);

        let seen = states.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn exponential_backoff_cursor_advances_and_resets() {
        let manual = ManualClock::new();
        let clock: ClockHandle = Arc::new(manual.clone());
        let (breaker, _states) = breaker_with_states(3, clock);

        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        manual.advance(Duration::from_secs(1));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Probe fails: next delay should be 2s, not another 1s.
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        manual.advance(Duration::from_secs(1));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            breaker.state(),
            CircuitState::Open,
            "1s after the second trip is not enough for a 2s backoff"
        );

        manual.advance(Duration::from_secs(1));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let probe = breaker.call(|| async { Ok::<_, &'static str>(()) }).await;
        assert!(probe.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Re-trip: the cursor should have reset, so the next delay is 1s again.
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        manual.advance(Duration::from_secs(1));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn half_open_admits_exactly_one_concurrent_probe() {
        let clock = crate::clock::tokio_clock();
        let config = CircuitBreakerConfig::new(
            1,
            ExponentialSchedule::new(Duration::from_millis(1), 2.0),
        );
        let breaker = Arc::new(
            CircuitBreaker::new(config, clock, |_| {}).expect("valid config"),
        );

        let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let b1 = breaker.clone();
        let b2 = breaker.clone();

        let t1 = tokio::spawn(async move { b1.call(|| async { Ok::<_, &'static str>(()) }).await });
        let t2 = tokio::spawn(async move { b2.call(|| async { Ok::<_, &'static str>(()) }).await });

        let (r1, r2) = tokio::join!(t1, t2);
        let (r1, r2) = (r1.unwrap(), r2.unwrap());
        let admitted = [&r1, &r2].into_iter().filter(|r| r.is_ok()).count();
        let rejected = [&r1, &r2]
            .into_iter()
            .filter(|r| matches!(r, Err(CircuitBreakerCallError::Open)))
            .count();
        assert_eq!(admitted, 1, "exactly one concurrent probe must be admitted");
        assert_eq!(rejected, 1, "the other concurrent probe must see Open");
    }

    #[tokio::test]
    async fn is_failure_predicate_excludes_non_failures() {
        let clock = crate::clock::tokio_clock();
        let config = CircuitBreakerConfig::new(2, ExponentialSchedule::new(Duration::from_millis(10), 2.0))
            .is_failure(|_: &&'static str| false);
        let breaker = CircuitBreaker::new(config, clock, |_| {}).expect("valid config");

        for _ in 0..10 {
            let result = breaker.call(|| async { Err::<(), _>("not a real failure") }).await;
            assert!(matches!(result, Err(CircuitBreakerCallError::Wrapped(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn rejects_zero_max_failures() {
        let config: CircuitBreakerConfig<&'static str> =
            CircuitBreakerConfig::new(0, ExponentialSchedule::new(Duration::from_secs(1), 2.0));
        assert!(config.validate().is_err());
    }
}
