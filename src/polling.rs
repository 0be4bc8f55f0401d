//! Adaptive polling engine (spec §4.2): per-execution probe cadence under
//! one of four strategies, with metrics and consecutive-error backoff.
//!
//! Grounded on spec §4.2's formulas directly; the per-execution sliding
//! window lives on [`crate::model::PollingMetrics`] (20-entry cap, mirroring
//! the teacher's `MemorySink` bounded ring-buffer eviction technique).

use crate::clock::Clock;
use crate::model::{PollingMetrics, Status};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStrategy {
    Fixed,
    Adaptive,
    Smart,
    Hybrid,
}

/// Polling configuration (spec §3 `PollingConfig`).
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub strategy: PollingStrategy,
    pub base_interval: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub backoff_factor: f64,
    pub activity_window: Duration,
    pub max_consecutive_errors: u32,
    pub battery_optimize: bool,
    pub adaptive_throttle: bool,
    pub per_status_interval: HashMap<String, Duration>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        let mut per_status_interval = HashMap::new();
        per_status_interval.insert("running".to_string(), Duration::from_secs(2));
        per_status_interval.insert("waiting".to_string(), Duration::from_secs(10));
        per_status_interval.insert("new".to_string(), Duration::from_secs(1));

        Self {
            strategy: PollingStrategy::Smart,
            base_interval: Duration::from_secs(5),
            min_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_factor: 2.0,
            activity_window: Duration::from_secs(300),
            max_consecutive_errors: 5,
            battery_optimize: false,
            adaptive_throttle: true,
            per_status_interval,
        }
    }
}

/// Whether the last observed activity for an execution was a terminal
/// status, and when it was observed — used by the adaptive strategy's
/// battery-optimize doubling and the smart strategy's age factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LastActivity {
    status_was_terminal: bool,
    observed_at_millis: u64,
}

struct Session {
    metrics: PollingMetrics,
    consecutive_errors: u32,
    last_activity: Option<LastActivity>,
    last_status: Option<String>,
    stopped: bool,
}

impl Session {
    fn new(started_at: std::time::SystemTime) -> Self {
        let mut metrics = PollingMetrics::default();
        metrics.started_at = Some(started_at);
        Self { metrics, consecutive_errors: 0, last_activity: None, last_status: None, stopped: false }
    }
}

/// Outcome of a single poll round, used to decide the next interval and
/// whether the session should continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Continue,
    Terminal,
    MaxErrorsExceeded,
}

/// Drives per-execution poll cadence. Owns no transport handle; callers
/// invoke their own probe and report the outcome via [`PollingEngine::record`].
pub struct PollingEngine {
    config: PollingConfig,
    clock: std::sync::Arc<dyn Clock>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl PollingEngine {
    pub fn new(config: PollingConfig, clock: std::sync::Arc<dyn Clock>) -> Self {
        Self { config, clock, sessions: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Begin a polling session for `execution_id`. Idempotent: calling it
    /// again while a session is active is a no-op on existing metrics.
    pub fn start(&self, execution_id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.entry(execution_id.to_string()).or_insert_with(|| {
            Session::new(std::time::UNIX_EPOCH + Duration::from_millis(self.clock.now_millis()))
        });
    }

    /// Cancel the session; freezes metrics (spec §4.2 `stop`). Idempotent.
    pub fn stop(&self, execution_id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(session) = sessions.get_mut(execution_id) {
            if !session.stopped {
                session.stopped = true;
                session.metrics.freeze(std::time::UNIX_EPOCH + Duration::from_millis(self.clock.now_millis()));
            }
        }
    }

    /// External hook: record status learned through a side channel without
    /// it going through a poll round-trip (spec §4.2 `recordActivity`).
    pub fn record_activity(&self, execution_id: &str, status: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(session) = sessions.get_mut(execution_id) {
            let terminal = Status::from_wire(status).is_terminal();
            session.last_activity =
                Some(LastActivity { status_was_terminal: terminal, observed_at_millis: self.clock.now_millis() });
        }
    }

    /// Record the outcome of one poll round for `execution_id`. `status` is
    /// the observed status string (or the last known one on failure).
    /// Returns what the caller should do next.
    pub fn record(&self, execution_id: &str, success: bool, status: &str, interval: Duration) -> PollOutcome {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        let session = match sessions.get_mut(execution_id) {
            Some(s) => s,
            None => return PollOutcome::Terminal,
        };

        session.metrics.record_poll(success, interval, status);
        let terminal = Status::from_wire(status).is_terminal();
        session.last_activity =
            Some(LastActivity { status_was_terminal: terminal, observed_at_millis: self.clock.now_millis() });
        session.last_status = Some(status.to_string());

        if success {
            session.consecutive_errors = 0;
            if terminal {
                session.stopped = true;
                session.metrics.freeze(std::time::UNIX_EPOCH + Duration::from_millis(self.clock.now_millis()));
                return PollOutcome::Terminal;
            }
            PollOutcome::Continue
        } else {
            session.consecutive_errors += 1;
            if session.consecutive_errors >= self.config.max_consecutive_errors {
                session.stopped = true;
                session.metrics.freeze(std::time::UNIX_EPOCH + Duration::from_millis(self.clock.now_millis()));
                return PollOutcome::MaxErrorsExceeded;
            }
            PollOutcome::Continue
        }
    }

    /// Compute the next poll interval for `execution_id` per the
    /// configured strategy (spec §4.2).
    pub fn next_interval(&self, execution_id: &str) -> Duration {
        let sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        let session = match sessions.get(execution_id) {
            Some(s) => s,
            None => return self.config.base_interval,
        };

        if session.consecutive_errors > 0 {
            return self.error_backoff_interval(session.consecutive_errors);
        }

        let interval = match self.config.strategy {
            PollingStrategy::Fixed => self.config.base_interval,
            PollingStrategy::Adaptive => self.adaptive_interval(session),
            PollingStrategy::Smart => self.smart_interval(session),
            PollingStrategy::Hybrid => self.adaptive_interval(session).max(self.smart_interval(session)),
        };
        clamp(interval, self.config.min_interval, self.config.max_interval)
    }

    fn error_backoff_interval(&self, consecutive_errors: u32) -> Duration {
        let multiplier = self.config.backoff_factor.powi(consecutive_errors as i32);
        let scaled = Duration::from_secs_f64(self.config.base_interval.as_secs_f64() * multiplier);
        clamp(scaled, self.config.min_interval, self.config.max_interval)
    }

    fn status_interval(&self, session: &Session) -> Duration {
        let last_status = session.last_status.as_deref().unwrap_or("running");
        self.config
            .per_status_interval
            .get(last_status)
            .copied()
            .unwrap_or(self.config.base_interval)
    }

    fn adaptive_interval(&self, session: &Session) -> Duration {
        let mut interval = clamp(self.status_interval(session), self.config.min_interval, self.config.max_interval);
        if self.config.battery_optimize {
            if let Some(activity) = &session.last_activity {
                if activity.status_was_terminal {
                    interval *= 2;
                }
            }
        }
        interval
    }

    fn smart_interval(&self, session: &Session) -> Duration {
        let mut interval = self.adaptive_interval(session);
        let now = self.clock.now_millis();
        let age = session
            .last_activity
            .map(|a| Duration::from_millis(now.saturating_sub(a.observed_at_millis)))
            .unwrap_or(Duration::ZERO);
        let age_factor = age_factor(age);
        interval = Duration::from_secs_f64(interval.as_secs_f64() * age_factor);

        if self.config.adaptive_throttle {
            let success_rate = session.metrics.success_rate();
            let error_rate = session.metrics.error_rate();
            let total_polls = session.metrics.total_polls;
            if success_rate > 0.8 && total_polls > 10 {
                interval = Duration::from_secs_f64(interval.as_secs_f64() * 0.8);
            }
            if error_rate > 0.3 && total_polls > 5 {
                interval = Duration::from_secs_f64(interval.as_secs_f64() * 1.5);
            }
        }
        interval
    }

    pub fn metrics_for(&self, execution_id: &str) -> Option<PollingMetricsSnapshot> {
        let sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.get(execution_id).map(|s| PollingMetricsSnapshot {
            total_polls: s.metrics.total_polls,
            successes: s.metrics.successes,
            errors: s.metrics.errors,
            average_interval: s.metrics.average_interval(),
            started_at: s.metrics.started_at,
            ended_at: s.metrics.ended_at,
        })
    }

    pub fn active_ids(&self) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.iter().filter(|(_, s)| !s.stopped).map(|(id, _)| id.clone()).collect()
    }

    /// Every active session's metrics at once, for a host's own status
    /// dashboard. Purely additive: a derived read over the same per-session
    /// metrics `metrics_for` exposes one at a time.
    pub fn snapshot(&self) -> HashMap<String, PollingMetricsSnapshot> {
        let sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions
            .iter()
            .filter(|(_, s)| !s.stopped)
            .map(|(id, s)| {
                (
                    id.clone(),
                    PollingMetricsSnapshot {
                        total_polls: s.metrics.total_polls,
                        successes: s.metrics.successes,
                        errors: s.metrics.errors,
                        average_interval: s.metrics.average_interval(),
                        started_at: s.metrics.started_at,
                        ended_at: s.metrics.ended_at,
                    },
                )
            })
            .collect()
    }
}

/// Read-only snapshot of [`PollingMetrics`] for external consumption,
/// avoiding leaking the internal sliding-window deque.
#[derive(Debug, Clone)]
pub struct PollingMetricsSnapshot {
    pub total_polls: u64,
    pub successes: u64,
    pub errors: u64,
    pub average_interval: Duration,
    pub started_at: Option<std::time::SystemTime>,
    pub ended_at: Option<std::time::SystemTime>,
}

fn age_factor(age: Duration) -> f64 {
    let minutes = age.as_secs_f64() / 60.0;
    if minutes < 5.0 {
        1.0
    } else if minutes < 15.0 {
        1.5
    } else if minutes < 30.0 {
        2.0
    } else if minutes < 60.0 {
        3.0
    } else {
        4.0
    }
}

fn clamp(d: Duration, min: Duration, max: Duration) -> Duration {
    d.clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn engine(strategy: PollingStrategy) -> PollingEngine {
        let config = PollingConfig { strategy, ..PollingConfig::default() };
        PollingEngine::new(config, Arc::new(ManualClock::new()))
    }

    #[test]
    fn fixed_strategy_always_returns_base_interval() {
        let engine = engine(PollingStrategy::Fixed);
        engine.start("exec-1");
        assert_eq!(engine.next_interval("exec-1"), Duration::from_secs(5));
        engine.record("exec-1", true, "running", Duration::from_secs(5));
        assert_eq!(engine.next_interval("exec-1"), Duration::from_secs(5));
    }

    #[test]
    fn terminal_poll_stops_session() {
        let engine = engine(PollingStrategy::Fixed);
        engine.start("exec-1");
        let outcome = engine.record("exec-1", true, "success", Duration::from_secs(1));
        assert_eq!(outcome, PollOutcome::Terminal);
        assert!(engine.active_ids().is_empty());
    }

    #[test]
    fn max_consecutive_errors_stops_session() {
        let mut config = PollingConfig::default();
        config.max_consecutive_errors = 3;
        let poller = PollingEngine::new(config, Arc::new(ManualClock::new()));
        poller.start("exec-1");
        poller.record("exec-1", false, "running", Duration::from_secs(1));
        poller.record("exec-1", false, "running", Duration::from_secs(1));
        let outcome = poller.record("exec-1", false, "running", Duration::from_secs(1));
        assert_eq!(outcome, PollOutcome::MaxErrorsExceeded);
        assert!(poller.active_ids().is_empty());
    }

    #[test]
    fn error_backoff_grows_with_consecutive_failures() {
        let mut config = PollingConfig::default();
        config.max_interval = Duration::from_secs(300);
        let poller = PollingEngine::new(config, Arc::new(ManualClock::new()));
        poller.start("exec-1");
        poller.record("exec-1", false, "running", Duration::from_secs(1));
        let after_one = poller.next_interval("exec-1");
        poller.record("exec-1", false, "running", Duration::from_secs(1));
        let after_two = poller.next_interval("exec-1");
        assert!(after_two > after_one);
    }

    #[test]
    fn hybrid_is_never_less_aggressive_than_either_component() {
        let poller = engine(PollingStrategy::Hybrid);
        poller.start("exec-1");
        for _ in 0..15 {
            poller.record("exec-1", true, "running", Duration::from_secs(1));
        }
        let hybrid = poller.next_interval("exec-1");

        let adaptive_engine = engine(PollingStrategy::Adaptive);
        adaptive_engine.start("exec-1");
        for _ in 0..15 {
            adaptive_engine.record("exec-1", true, "running", Duration::from_secs(1));
        }
        let adaptive = adaptive_engine.next_interval("exec-1");

        assert!(hybrid >= adaptive);
    }

    #[test]
    fn smart_strategy_widens_interval_as_activity_ages() {
        let clock = Arc::new(ManualClock::new());
        let config = PollingConfig { strategy: PollingStrategy::Smart, adaptive_throttle: false, ..PollingConfig::default() };
        let poller = PollingEngine::new(config, clock.clone());
        poller.start("exec-1");
        poller.record("exec-1", true, "running", Duration::from_secs(1));
        let fresh = poller.next_interval("exec-1");

        clock.advance(20 * 60 * 1000);
        let stale = poller.next_interval("exec-1");
        assert!(stale > fresh);
    }

    #[test]
    fn record_activity_marks_last_activity_without_a_poll_round_trip() {
        let poller = engine(PollingStrategy::Adaptive);
        poller.start("exec-1");
        poller.record_activity("exec-1", "success");
        let snapshot = poller.metrics_for("exec-1").unwrap();
        assert_eq!(snapshot.total_polls, 0);
    }

    #[test]
    fn metrics_for_missing_session_is_none() {
        let poller = engine(PollingStrategy::Fixed);
        assert!(poller.metrics_for("nope").is_none());
    }

    #[test]
    fn stop_is_idempotent_and_freezes_metrics() {
        let poller = engine(PollingStrategy::Fixed);
        poller.start("exec-1");
        poller.stop("exec-1");
        let snapshot_a = poller.metrics_for("exec-1").unwrap();
        poller.stop("exec-1");
        let snapshot_b = poller.metrics_for("exec-1").unwrap();
        assert_eq!(snapshot_a.ended_at, snapshot_b.ended_at);
    }

    #[test]
    fn snapshot_covers_every_active_session_and_omits_stopped_ones() {
        let poller = engine(PollingStrategy::Fixed);
        poller.start("exec-1");
        poller.start("exec-2");
        poller.record("exec-1", true, "running", Duration::from_secs(1));
        poller.record("exec-2", true, "success", Duration::from_secs(1));

        let snapshot = poller.snapshot();
        assert_eq!(snapshot.len(), 1, "exec-2 went terminal and should be excluded");
        assert!(snapshot.contains_key("exec-1"));
        assert_eq!(snapshot["exec-1"].total_polls, 1);
    }
}
