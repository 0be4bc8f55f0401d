//! The error kernel (spec §4.1): classification, retry scheduling, and the
//! circuit breaker, fused into a single `execute_with_retry` entry point.
//!
//! Grounded on the teacher's `retry.rs` attempt loop and `stack.rs`'s
//! breaker-wraps-retry ordering, but unlike the teacher's composable
//! `ResilienceStack<E>` the breaker here is not a separate layer: spec
//! §3 fixes exactly one `CircuitState` per kernel instance, so `Kernel`
//! owns both the breaker and the retry policy directly.

use crate::backoff;
use crate::circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::clock::{Clock, MonotonicClock};
use crate::error::{EngineError, ErrorKind};
use crate::jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{emit_best_effort, CircuitBreakerEvent, KernelEvent, NullSink, RetryEvent, RuntimeEvent};
use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Immutable retry configuration (spec §3 `RetryPolicy`).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter_fraction: f64,
    pub retryable_kinds: HashSet<ErrorKind>,
    pub retryable_statuses: HashSet<u16>,
    pub circuit_breaker_enabled: bool,
    pub circuit_breaker_threshold: usize,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let mut retryable_kinds = HashSet::new();
        retryable_kinds.insert(ErrorKind::Network);
        retryable_kinds.insert(ErrorKind::Timeout);
        retryable_kinds.insert(ErrorKind::ServerError);
        retryable_kinds.insert(ErrorKind::RateLimit);

        let mut retryable_statuses = HashSet::new();
        for s in [500, 502, 503, 504, 429] {
            retryable_statuses.insert(s);
        }

        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_fraction: 0.1,
            retryable_kinds,
            retryable_statuses,
            circuit_breaker_enabled: true,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(30),
        }
    }
}

/// Per-operation bookkeeping (spec §4.1 `resetOperation`). Separate from
/// the single shared breaker; grounded in the teacher's
/// `CircuitBreakerRegistry` keyed-map shape, repurposed here as plain
/// diagnostics rather than a second set of breakers.
#[derive(Debug, Clone, Default)]
pub struct OperationStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_outcome_at_millis: Option<u64>,
}

/// The error kernel. Generic over a telemetry `Sink` the way the teacher's
/// `TimeoutLayer<Sink>` is: defaults to `NullSink` so existing callers pay
/// nothing, and `with_telemetry_sink` swaps in a real one.
pub struct Kernel<Sink = NullSink> {
    policy: RetryPolicy,
    breaker: CircuitBreaker,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    operations: Mutex<HashMap<String, OperationStats>>,
    sink: Sink,
}

impl Kernel<NullSink> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_sleeper(policy, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        let breaker_config = if policy.circuit_breaker_enabled {
            CircuitBreakerConfig {
                failure_threshold: policy.circuit_breaker_threshold,
                cooldown: policy.circuit_breaker_cooldown,
                half_open_max_calls: 1,
            }
        } else {
            CircuitBreakerConfig::disabled()
        };
        Self {
            policy,
            breaker: CircuitBreaker::with_config(breaker_config),
            sleeper,
            clock: Arc::new(MonotonicClock::default()),
            operations: Mutex::new(HashMap::new()),
            sink: NullSink,
        }
    }
}

impl<Sink> Kernel<Sink> {
    /// Attach a telemetry sink. Every retry attempt, exhaustion, and circuit
    /// breaker transition observed by `execute_with_retry` flows through it.
    pub fn with_telemetry_sink<NewSink>(self, sink: NewSink) -> Kernel<NewSink> {
        Kernel {
            policy: self.policy,
            breaker: self.breaker,
            sleeper: self.sleeper,
            clock: self.clock,
            operations: self.operations,
            sink,
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        let clock = Arc::new(clock);
        self.breaker = self.breaker.clone().with_clock_arc(clock.clone());
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breaker_state(&self) -> crate::circuit_breaker::CircuitState {
        self.breaker.state()
    }

    pub fn reset_breaker(&self) {
        self.breaker.reset();
    }

    pub fn reset_operation(&self, operation_id: &str) {
        self.operations.lock().unwrap_or_else(|p| p.into_inner()).remove(operation_id);
    }

    pub fn operation_stats(&self, operation_id: &str) -> Option<OperationStats> {
        self.operations.lock().unwrap_or_else(|p| p.into_inner()).get(operation_id).cloned()
    }

    /// spec §4.1 `shouldRetry`.
    pub fn should_retry(&self, err: &EngineError, attempt: usize) -> bool {
        if attempt > self.policy.max_attempts {
            return false;
        }
        if !self.policy.retryable_kinds.contains(&err.kind()) {
            return false;
        }
        if let Some(status) = err.status() {
            if !self.policy.retryable_statuses.contains(&status) {
                return false;
            }
        }
        if !err.is_retryable() {
            return false;
        }
        if err.kind() == ErrorKind::RateLimit {
            if let Some(retry_after) = err.retry_after() {
                if retry_after > self.policy.max_delay {
                    return false;
                }
            }
        }
        true
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        let base = backoff::base_delay(self.policy.initial_delay, self.policy.backoff_factor, attempt);
        let jittered = jitter::apply(base, self.policy.jitter_fraction);
        backoff::clamp(jittered, self.policy.initial_delay, self.policy.max_delay)
    }

    fn record_attempt(&self, operation_id: &str, success: bool) {
        let mut guard = self.operations.lock().unwrap_or_else(|p| p.into_inner());
        let stats = guard.entry(operation_id.to_string()).or_default();
        stats.attempts += 1;
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        stats.last_outcome_at_millis = Some(self.clock.now_millis());
    }

    /// Emits a `CircuitBreakerEvent` if admitting/recording this outcome
    /// moved the breaker into a different state than it was in before.
    async fn emit_breaker_transition(&self, before: CircuitState, after: CircuitState)
    where
        Sink: tower::Service<RuntimeEvent, Response = ()> + Clone + Send + 'static,
        Sink::Error: std::error::Error + Send + 'static,
        Sink::Future: Send + 'static,
    {
        if before == after {
            return;
        }
        let event = match after {
            CircuitState::Open => CircuitBreakerEvent::Opened { failure_count: self.breaker.failure_count() },
            CircuitState::HalfOpen => CircuitBreakerEvent::HalfOpen,
            CircuitState::Closed => CircuitBreakerEvent::Closed,
        };
        emit_best_effort(self.sink.clone(), RuntimeEvent::Kernel(KernelEvent::CircuitBreaker(event))).await;
    }
}

impl<Sink> Kernel<Sink>
where
    Sink: tower::Service<RuntimeEvent, Response = ()> + Clone + Send + 'static,
    Sink::Error: std::error::Error + Send + 'static,
    Sink::Future: Send + 'static,
{
    /// spec §4.1 `executeWithRetry`.
    pub async fn execute_with_retry<T, Fut, Op>(
        &self,
        operation_id: &str,
        mut thunk: Op,
    ) -> Result<T, EngineError>
    where
        Fut: Future<Output = Result<T, EngineError>>,
        Op: FnMut() -> Fut,
    {
        let started_at = Instant::now();
        for attempt in 1..=self.policy.max_attempts {
            let before = self.breaker.state();
            let admission = match self.breaker.admit() {
                Ok(admission) => admission,
                Err(circuit_err) => {
                    self.record_attempt(operation_id, false);
                    self.emit_breaker_transition(before, self.breaker.state()).await;
                    return Err(circuit_err);
                }
            };

            match thunk().await {
                Ok(value) => {
                    self.breaker.record_success(admission);
                    self.record_attempt(operation_id, true);
                    self.emit_breaker_transition(before, self.breaker.state()).await;
                    return Ok(value);
                }
                Err(raw) => {
                    let classified = EngineError::classify(raw);
                    self.breaker.record_failure(admission);
                    self.record_attempt(operation_id, false);
                    self.emit_breaker_transition(before, self.breaker.state()).await;

                    if !self.should_retry(&classified, attempt) {
                        emit_best_effort(
                            self.sink.clone(),
                            RuntimeEvent::Kernel(KernelEvent::Retry(RetryEvent::Exhausted {
                                total_attempts: attempt,
                                total_duration: started_at.elapsed(),
                            })),
                        )
                        .await;
                        return Err(classified);
                    }
                    if attempt == self.policy.max_attempts {
                        emit_best_effort(
                            self.sink.clone(),
                            RuntimeEvent::Kernel(KernelEvent::Retry(RetryEvent::Exhausted {
                                total_attempts: attempt,
                                total_duration: started_at.elapsed(),
                            })),
                        )
                        .await;
                        return Err(classified);
                    }

                    let delay = self.delay_for(attempt);
                    emit_best_effort(
                        self.sink.clone(),
                        RuntimeEvent::Kernel(KernelEvent::Retry(RetryEvent::Attempt { attempt, delay })),
                    )
                    .await;
                    self.sleeper.sleep(delay).await;
                }
            }
        }

        unreachable!("retry loop always returns within max_attempts iterations")
    }
}

/// `CircuitBreaker::with_clock` takes an owned `Clock` impl; `Kernel` needs
/// to install the same `Arc<dyn Clock>` it holds itself, so this wraps the
/// Arc in a thin adapter that is itself a `Clock`.
struct SharedClock(Arc<dyn Clock>);

impl std::fmt::Debug for SharedClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Clock for SharedClock {
    fn now_millis(&self) -> u64 {
        self.0.now_millis()
    }
}

impl CircuitBreaker {
    fn with_clock_arc(self, clock: Arc<dyn Clock>) -> Self {
        self.with_clock(SharedClock(clock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy { max_attempts, ..RetryPolicy::default() }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let kernel = Kernel::with_sleeper(policy(3), Arc::new(InstantSleeper));
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let result = kernel
            .execute_with_retry("op", || {
                let counter = counter2.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, EngineError>(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_recoverable_errors_until_success() {
        let kernel = Kernel::with_sleeper(policy(5), Arc::new(InstantSleeper));
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let result = kernel
            .execute_with_retry("op", || {
                let counter = counter2.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(EngineError::new(ErrorKind::Network, "transient"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_retries_non_recoverable_kind() {
        let kernel = Kernel::with_sleeper(policy(5), Arc::new(InstantSleeper));
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let result = kernel
            .execute_with_retry("op", || {
                let counter = counter2.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(EngineError::new(ErrorKind::Authentication, "nope"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let kernel = Kernel::with_sleeper(policy(3), Arc::new(InstantSleeper));
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let result = kernel
            .execute_with_retry("op", || {
                let counter = counter2.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(EngineError::new(ErrorKind::ServerError, "down").with_status(503))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn max_retries_zero_never_retries() {
        let kernel = Kernel::with_sleeper(policy(1), Arc::new(InstantSleeper));
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let _ = kernel
            .execute_with_retry("op", || {
                let counter = counter2.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(EngineError::new(ErrorKind::Network, "down"))
                }
            })
            .await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delay_is_always_within_initial_and_max() {
        let mut p = policy(4);
        p.initial_delay = Duration::from_millis(100);
        p.max_delay = Duration::from_secs(1);
        p.backoff_factor = 2.0;
        p.jitter_fraction = 0.5;
        let sleeper = TrackingSleeper::new();
        let kernel = Kernel::with_sleeper(p, Arc::new(sleeper.clone()));
        let _ = kernel
            .execute_with_retry("op", || async {
                Err::<(), _>(EngineError::new(ErrorKind::Network, "down"))
            })
            .await;
        for call in 0..sleeper.calls() {
            let d = sleeper.call_at(call).unwrap();
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn backoff_factor_one_is_constant_delay_ignoring_jitter() {
        let mut p = policy(4);
        p.initial_delay = Duration::from_millis(200);
        p.max_delay = Duration::from_secs(10);
        p.backoff_factor = 1.0;
        p.jitter_fraction = 0.0;
        let sleeper = TrackingSleeper::new();
        let kernel = Kernel::with_sleeper(p, Arc::new(sleeper.clone()));
        let _ = kernel
            .execute_with_retry("op", || async {
                Err::<(), _>(EngineError::new(ErrorKind::Network, "down"))
            })
            .await;
        assert_eq!(sleeper.calls(), 3);
        for i in 0..3 {
            assert_eq!(sleeper.call_at(i).unwrap(), Duration::from_millis(200));
        }
    }

    #[tokio::test]
    async fn breaker_opens_with_threshold_one_on_first_failure() {
        let mut p = policy(1);
        p.circuit_breaker_threshold = 1;
        p.circuit_breaker_cooldown = Duration::from_secs(1000);
        let kernel = Kernel::with_sleeper(p, Arc::new(InstantSleeper));
        let _ = kernel
            .execute_with_retry("op", || async {
                Err::<(), _>(EngineError::new(ErrorKind::Network, "down"))
            })
            .await;
        assert_eq!(kernel.breaker_state(), crate::circuit_breaker::CircuitState::Open);

        let result = kernel.execute_with_retry("op", || async { Ok::<_, EngineError>(1) }).await;
        assert!(result.is_err());
        assert!(!result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn rate_limit_retry_after_beyond_max_delay_is_not_retried() {
        let mut p = policy(5);
        p.max_delay = Duration::from_secs(10);
        let kernel = Kernel::with_sleeper(p, Arc::new(InstantSleeper));
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let result = kernel
            .execute_with_retry("op", || {
                let counter = counter2.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let meta = crate::error::ErrorMetadata::with_retry_after(Duration::from_secs(60));
                    Err::<(), _>(
                        EngineError::new(ErrorKind::RateLimit, "slow down").with_metadata(meta),
                    )
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1, "retry-after beyond max_delay must gate retry");
    }

    #[tokio::test]
    async fn reset_operation_clears_only_that_operations_bookkeeping() {
        let kernel = Kernel::with_sleeper(policy(3), Arc::new(InstantSleeper));
        let _ = kernel.execute_with_retry("a", || async { Ok::<_, EngineError>(()) }).await;
        let _ = kernel.execute_with_retry("b", || async { Ok::<_, EngineError>(()) }).await;
        assert!(kernel.operation_stats("a").is_some());
        kernel.reset_operation("a");
        assert!(kernel.operation_stats("a").is_none());
        assert!(kernel.operation_stats("b").is_some());
    }

    #[tokio::test]
    async fn telemetry_sink_observes_retry_attempts_and_breaker_open() {
        use crate::telemetry::sinks::MemorySink;
        use crate::telemetry::{CircuitBreakerEvent, KernelEvent, RuntimeEvent};

        let mut p = policy(2);
        p.circuit_breaker_threshold = 1;
        p.circuit_breaker_cooldown = Duration::from_secs(1000);
        let sink = MemorySink::new();
        let kernel =
            Kernel::with_sleeper(p, Arc::new(InstantSleeper)).with_telemetry_sink(sink.clone());

        let _ = kernel
            .execute_with_retry("op", || async {
                Err::<(), _>(EngineError::new(ErrorKind::Network, "down"))
            })
            .await;

        let events = sink.events();
        assert!(
            events.iter().any(|e| matches!(e, RuntimeEvent::Kernel(KernelEvent::Retry(RetryEvent::Attempt { .. })))),
            "expected at least one retry attempt event, got {events:?}"
        );
        assert!(
            events.iter().any(|e| matches!(
                e,
                RuntimeEvent::Kernel(KernelEvent::CircuitBreaker(CircuitBreakerEvent::Opened { .. }))
            )),
            "expected a circuit breaker opened event, got {events:?}"
        );
    }
}
