//! Circuit breaker: the gate half of the error kernel (spec §4.1).
//!
//! Split into `admit`/`record_*` rather than a single `execute` closure
//! (contrast the teacher's `CircuitBreakerPolicy::execute`) because the
//! kernel interleaves breaker admission with its own retry loop — the
//! breaker here is a building block `kernel::Kernel` drives, not the
//! top-level entry point.

use crate::clock::{Clock, MonotonicClock};
use crate::error::EngineError;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Which admission path a call took; needed by the caller to know whether
/// to decrement the half-open call counter on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    HalfOpenProbe,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub cooldown: Duration,
    pub half_open_max_calls: usize,
}

impl CircuitBreakerConfig {
    pub fn disabled() -> Self {
        Self { failure_threshold: usize::MAX, cooldown: Duration::from_secs(0), half_open_max_calls: usize::MAX }
    }
}

struct State {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_calls: AtomicUsize,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<State>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, cooldown: Duration) -> Self {
        Self::with_config(CircuitBreakerConfig { failure_threshold, cooldown, half_open_max_calls: 1 })
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(State {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                half_open_calls: AtomicUsize::new(0),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn state(&self) -> CircuitState {
        match self.state.state.load(Ordering::Acquire) {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => unreachable!("invalid circuit breaker state"),
        }
    }

    pub fn failure_count(&self) -> usize {
        self.state.failure_count.load(Ordering::Acquire)
    }

    /// Reset to closed, zero failures. Used by `Kernel::reset_breaker`.
    pub fn reset(&self) {
        self.state.state.store(STATE_CLOSED, Ordering::Release);
        self.state.failure_count.store(0, Ordering::Release);
        self.state.opened_at_millis.store(0, Ordering::Release);
        self.state.half_open_calls.store(0, Ordering::Release);
    }

    /// Decide whether a call may proceed right now. Spec §4.1 steps 1-2:
    /// open + cooldown not elapsed → fail synchronously; open + cooldown
    /// elapsed → transition to half-open and allow exactly one caller
    /// through per `half_open_max_calls`.
    pub fn admit(&self) -> Result<Admission, EngineError> {
        loop {
            match self.state.state.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let now = self.clock.now_millis();
                    let elapsed = now.saturating_sub(opened_at);
                    if elapsed >= self.config.cooldown.as_millis() as u64 {
                        match self.state.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                tracing::info!("circuit breaker -> half-open");
                                self.state.half_open_calls.store(1, Ordering::Release);
                                return Ok(Admission::HalfOpenProbe);
                            }
                            Err(STATE_HALF_OPEN) => continue,
                            Err(STATE_CLOSED) => return Ok(Admission::Normal),
                            Err(_) => unreachable!("invalid state transition"),
                        }
                    }
                    return Err(EngineError::circuit_open(
                        self.state.failure_count.load(Ordering::Acquire),
                        Duration::from_millis(elapsed),
                    ));
                }
                STATE_HALF_OPEN => {
                    let current = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_max_calls {
                        self.state.half_open_calls.fetch_sub(1, Ordering::Release);
                        return Err(EngineError::circuit_open(
                            self.state.failure_count.load(Ordering::Acquire),
                            Duration::from_millis(0),
                        ));
                    }
                    return Ok(Admission::HalfOpenProbe);
                }
                STATE_CLOSED => return Ok(Admission::Normal),
                _ => unreachable!("invalid circuit breaker state"),
            }
        }
    }

    pub fn record_success(&self, admission: Admission) {
        if admission == Admission::HalfOpenProbe {
            self.state.half_open_calls.fetch_sub(1, Ordering::Release);
        }
        match self.state.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!("circuit breaker -> closed");
                }
            }
            STATE_CLOSED => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    pub fn record_failure(&self, admission: Admission) {
        if admission == Admission::HalfOpenProbe {
            self.state.half_open_calls.fetch_sub(1, Ordering::Release);
        }
        let current = self.state.state.load(Ordering::Acquire);
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::warn!(failures, "circuit breaker: probe failed -> open");
                }
            }
            STATE_CLOSED => {
                if failures >= self.config.failure_threshold
                    && self
                        .state
                        .state
                        .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::error!(failures, threshold = self.config.failure_threshold, "circuit breaker -> open");
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn starts_closed_and_admits() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(1));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.admit().unwrap(), Admission::Normal);
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(10));
        for _ in 0..3 {
            let adm = cb.admit().unwrap();
            cb.record_failure(adm);
        }
        assert_eq!(cb.state(), CircuitState::Open);
        let err = cb.admit().unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn transitions_to_half_open_after_cooldown_via_manual_clock() {
        let clock = ManualClock::new();
        let cb = CircuitBreaker::new(1, Duration::from_millis(100)).with_clock(clock.clone());
        let adm = cb.admit().unwrap();
        cb.record_failure(adm);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.admit().is_err(), "still within cooldown");

        clock.advance(150);
        let adm = cb.admit().unwrap();
        assert_eq!(adm, Admission::HalfOpenProbe);
        cb.record_success(adm);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn reopens_if_half_open_probe_fails() {
        let clock = ManualClock::new();
        let cb = CircuitBreaker::new(1, Duration::from_millis(100)).with_clock(clock.clone());
        let adm = cb.admit().unwrap();
        cb.record_failure(adm);
        clock.advance(150);
        let adm = cb.admit().unwrap();
        cb.record_failure(adm);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_limits_concurrent_probes() {
        let clock = ManualClock::new();
        let cb = CircuitBreaker::new(1, Duration::from_millis(100)).with_clock(clock.clone());
        let adm = cb.admit().unwrap();
        cb.record_failure(adm);
        clock.advance(150);

        assert_eq!(cb.admit().unwrap(), Admission::HalfOpenProbe);
        assert!(cb.admit().is_err(), "second concurrent probe must be rejected");
    }

    #[test]
    fn disabled_config_never_opens() {
        let cb = CircuitBreaker::with_config(CircuitBreakerConfig::disabled());
        for _ in 0..1000 {
            let adm = cb.admit().unwrap();
            cb.record_failure(adm);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn success_in_closed_state_resets_failure_count() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(1));
        for _ in 0..2 {
            let adm = cb.admit().unwrap();
            cb.record_failure(adm);
        }
        let adm = cb.admit().unwrap();
        cb.record_success(adm);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn reset_returns_to_closed_from_open() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(1000));
        let adm = cb.admit().unwrap();
        cb.record_failure(adm);
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }
}
