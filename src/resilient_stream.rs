//! Resilient stream wrapper (spec §4.6): wraps an arbitrary upstream
//! sequence with a recovery policy keyed by error kind — restart, retry
//! with backoff, fall back to a substitute value, skip, or escalate.
//!
//! Grounded on the teacher's `stack.rs` (a policy composed from named
//! strategies, one entry point dispatching to the configured behavior) and
//! reuses `backoff.rs`/`jitter.rs` for the retry strategy's delay formula,
//! since spec §4.6 explicitly says retry "uses the delay formula from
//! §4.1".

use crate::backoff;
use crate::clock::Clock;
use crate::error::{EngineError, ErrorKind};
use crate::jitter;
use crate::sleeper::Sleeper;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

const HEALTH_ERROR_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    Restart,
    Retry,
    Fallback,
    Skip,
    Escalate,
}

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    pub default_strategy: RecoveryStrategy,
    pub strategy_by_kind: HashMap<ErrorKind, RecoveryStrategy>,
    pub initial_retry_delay: Duration,
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter_fraction: f64,
    pub health_check_enabled: bool,
    pub health_check_interval: Duration,
    pub health_check_error_threshold: usize,
    pub health_check_success_rate_floor: f64,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            default_strategy: RecoveryStrategy::Retry,
            strategy_by_kind: HashMap::new(),
            initial_retry_delay: Duration::from_millis(500),
            max_retries: 3,
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.1,
            health_check_enabled: true,
            health_check_interval: Duration::from_secs(30),
            health_check_error_threshold: 5,
            health_check_success_rate_floor: 0.5,
        }
    }
}

impl RecoveryPolicy {
    pub fn strategy_for(&self, kind: ErrorKind) -> RecoveryStrategy {
        self.strategy_by_kind.get(&kind).copied().unwrap_or(self.default_strategy)
    }
}

/// Per-stream health bookkeeping (spec §4.6).
#[derive(Debug, Clone)]
pub struct StreamHealth {
    successes: u64,
    errors: u64,
    total_response_time: Duration,
    recent_errors: VecDeque<EngineError>,
    last_success_at: Option<SystemTime>,
    last_error_at: Option<SystemTime>,
}

impl Default for StreamHealth {
    fn default() -> Self {
        Self {
            successes: 0,
            errors: 0,
            total_response_time: Duration::ZERO,
            recent_errors: VecDeque::with_capacity(HEALTH_ERROR_WINDOW),
            last_success_at: None,
            last_error_at: None,
        }
    }
}

impl StreamHealth {
    fn record_success(&mut self, at: SystemTime, response_time: Duration) {
        self.successes += 1;
        self.total_response_time += response_time;
        self.last_success_at = Some(at);
    }

    fn record_error(&mut self, at: SystemTime, error: EngineError) {
        self.errors += 1;
        self.last_error_at = Some(at);
        if self.recent_errors.len() == HEALTH_ERROR_WINDOW {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(error);
    }

    pub fn total(&self) -> u64 {
        self.successes + self.errors
    }

    pub fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            1.0
        } else {
            self.successes as f64 / self.total() as f64
        }
    }

    pub fn average_response_time(&self) -> Duration {
        if self.successes == 0 {
            Duration::ZERO
        } else {
            self.total_response_time / self.successes as u32
        }
    }

    pub fn recent_error_count(&self) -> usize {
        self.recent_errors.len()
    }

    pub fn last_success_at(&self) -> Option<SystemTime> {
        self.last_success_at
    }

    pub fn last_error_at(&self) -> Option<SystemTime> {
        self.last_error_at
    }

    /// Spec §4.6: "if success rate ≤ 0.5 and the error window shows ≥
    /// threshold errors, force a restart."
    fn needs_forced_restart(&self, success_rate_floor: f64, error_threshold: usize) -> bool {
        self.total() > 0 && self.success_rate() <= success_rate_floor && self.recent_error_count() >= error_threshold
    }
}

/// Outcome of feeding one upstream item through the recovery policy.
#[derive(Debug)]
pub enum RecoveryOutcome<T> {
    /// A value to forward downstream.
    Emit(T),
    /// The upstream should be resubscribed (restart/retry exhausted or
    /// unconditional restart); caller drives the actual resubscription.
    Resubscribe,
    /// The error should propagate to the downstream (escalate, or retry
    /// exhausted).
    Escalate(EngineError),
    /// The error was swallowed; no emission, no resubscription.
    Skipped,
}

/// Drives the recovery policy for a single upstream error, given the
/// stream's current retry count. Pure decision function — the actual
/// resubscription/backoff sleep is performed by the caller driving the
/// stream loop (see `ResilientStream`), since only the caller owns the
/// upstream factory and the runtime clock/sleeper.
pub fn decide<T>(policy: &RecoveryPolicy, fallback_value: Option<&T>, error: &EngineError, retries_used: u32) -> RecoveryOutcome<T>
where
    T: Clone,
{
    match policy.strategy_for(error.kind()) {
        RecoveryStrategy::Restart => RecoveryOutcome::Resubscribe,
        RecoveryStrategy::Retry => {
            if retries_used < policy.max_retries {
                RecoveryOutcome::Resubscribe
            } else {
                RecoveryOutcome::Escalate(error.clone())
            }
        }
        RecoveryStrategy::Fallback => match fallback_value {
            Some(value) => RecoveryOutcome::Emit(value.clone()),
            None => RecoveryOutcome::Escalate(error.clone()),
        },
        RecoveryStrategy::Skip => RecoveryOutcome::Skipped,
        RecoveryStrategy::Escalate => RecoveryOutcome::Escalate(error.clone()),
    }
}

/// Delay before a restart/retry resubscription, per spec §4.6 ("retry:
/// same as restart but bounded by maxRetries and using the delay formula
/// from §4.1"; restart always waits `initialRetryDelay` unbackoffed).
pub fn recovery_delay(policy: &RecoveryPolicy, strategy: RecoveryStrategy, retries_used: u32) -> Duration {
    match strategy {
        RecoveryStrategy::Retry => {
            let base = backoff::base_delay(policy.initial_retry_delay, policy.backoff_factor, retries_used as usize + 1);
            let jittered = jitter::apply(base, policy.jitter_fraction);
            backoff::clamp(jittered, policy.initial_retry_delay, policy.max_delay)
        }
        _ => policy.initial_retry_delay,
    }
}

/// Drives the wrap-with-recovery loop over an upstream stream factory. `T`
/// is the item type, `Fac` produces a fresh upstream each time the policy
/// resubscribes.
pub struct ResilientStream<T, Fac> {
    factory: Fac,
    policy: RecoveryPolicy,
    fallback_value: Option<T>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    health: Mutex<StreamHealth>,
    last_health_check_millis: Mutex<u64>,
}

impl<T, Fac, S> ResilientStream<T, Fac>
where
    T: Clone + Send + 'static,
    Fac: Fn() -> S,
    S: futures::Stream<Item = Result<T, EngineError>> + Unpin,
{
    pub fn new(factory: Fac, policy: RecoveryPolicy, fallback_value: Option<T>, sleeper: Arc<dyn Sleeper>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self {
            factory,
            policy,
            fallback_value,
            sleeper,
            clock,
            health: Mutex::new(StreamHealth::default()),
            last_health_check_millis: Mutex::new(now),
        }
    }

    pub fn health_snapshot(&self) -> StreamHealth {
        self.health.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn now(&self) -> SystemTime {
        std::time::UNIX_EPOCH + Duration::from_millis(self.clock.now_millis())
    }

    fn record_success(&self, response_time: Duration) {
        self.health.lock().unwrap_or_else(|p| p.into_inner()).record_success(self.now(), response_time);
    }

    fn record_error(&self, error: EngineError) {
        self.health.lock().unwrap_or_else(|p| p.into_inner()).record_error(self.now(), error);
    }

    fn health_forces_restart(&self) -> bool {
        if !self.policy.health_check_enabled {
            return false;
        }
        let mut last_check = self.last_health_check_millis.lock().unwrap_or_else(|p| p.into_inner());
        let now = self.clock.now_millis();
        if now.saturating_sub(*last_check) < self.policy.health_check_interval.as_millis() as u64 {
            return false;
        }
        *last_check = now;
        let health = self.health.lock().unwrap_or_else(|p| p.into_inner());
        health.needs_forced_restart(self.policy.health_check_success_rate_floor, self.policy.health_check_error_threshold)
    }

    /// Consume the wrapped upstream, forwarding values and applying the
    /// recovery policy on error, until escalation or exhaustion. Returns
    /// the final `Escalate` error, if the stream ended that way.
    pub async fn run(self: Arc<Self>, mut on_item: impl FnMut(T), mut on_health_restart: impl FnMut()) -> Option<EngineError> {
        let mut upstream = Box::pin((self.factory)());
        let mut retries_used: u32 = 0;
        loop {
            if self.health_forces_restart() {
                on_health_restart();
                upstream = Box::pin((self.factory)());
                retries_used = 0;
                continue;
            }

            let poll_started = std::time::Instant::now();
            match futures::StreamExt::next(&mut upstream).await {
                None => return None,
                Some(Ok(item)) => {
                    self.record_success(poll_started.elapsed());
                    retries_used = 0;
                    on_item(item);
                }
                Some(Err(error)) => {
                    self.record_error(error.clone());
                    let strategy = self.policy.strategy_for(error.kind());
                    match decide(&self.policy, self.fallback_value.as_ref(), &error, retries_used) {
                        RecoveryOutcome::Emit(value) => on_item(value),
                        RecoveryOutcome::Skipped => {}
                        RecoveryOutcome::Escalate(err) => return Some(err),
                        RecoveryOutcome::Resubscribe => {
                            let delay = recovery_delay(&self.policy, strategy, retries_used);
                            self.sleeper.sleep(delay).await;
                            retries_used += 1;
                            upstream = Box::pin((self.factory)());
                        }
                    }
                }
            }
        }
    }
}
