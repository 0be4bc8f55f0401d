use std::fmt;
use std::time::Duration;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Runtime events emitted by the kernel, poller, and queue.
///
/// Every stateful module in this crate emits structured events describing
/// its behavior, independent of the domain-level `WorkflowEvent`/
/// `EngineError` streams the reactive client exposes publicly (spec §9
/// distinguishes "runtime events" from those). These are for
/// observability: logging, metrics aggregation, or forwarding to an
/// external collector via a `TelemetrySink`.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// Error-kernel events (retry attempts, circuit breaker transitions).
    Kernel(KernelEvent),
    /// Polling engine events.
    Polling(PollingEvent),
    /// Work queue events.
    Queue(QueueRuntimeEvent),
    /// Request outcome, emitted by any component that makes a remote call.
    Request(RequestOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    Retry(RetryEvent),
    CircuitBreaker(CircuitBreakerEvent),
}

/// Events emitted by `Kernel::execute_with_retry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// A retry attempt is about to be made.
    ///
    /// Emitted before sleeping and retrying a failed request.
    Attempt {
        /// The attempt number (1-indexed)
        attempt: usize,
        /// The backoff delay before this retry
        delay: Duration,
    },
    /// All retry attempts have been exhausted.
    Exhausted {
        /// Total number of attempts made
        total_attempts: usize,
        /// Total time spent retrying
        total_duration: Duration,
    },
}

/// Events emitted by the circuit breaker half of the error kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    /// Circuit transitioned to open state.
    Opened {
        /// Number of consecutive failures that triggered the open
        failure_count: usize,
    },
    /// Circuit transitioned to half-open state.
    HalfOpen,
    /// Circuit transitioned to closed state.
    Closed,
}

/// Events emitted by the polling engine (spec §4.2).
#[derive(Debug, Clone, PartialEq)]
pub enum PollingEvent {
    /// A polling session started for an execution id.
    SessionStarted { execution_id: String },
    /// A poll completed successfully with the observed status.
    PollSucceeded { execution_id: String, status: String, interval: Duration },
    /// A poll failed.
    PollFailed { execution_id: String, consecutive_errors: u32 },
    /// A session stopped (terminal status reached, or max consecutive
    /// errors exceeded).
    SessionStopped { execution_id: String },
}

/// Events emitted by the work queue (spec §4.5).
#[derive(Debug, Clone, PartialEq)]
pub enum QueueRuntimeEvent {
    ItemEnqueued { item_id: String, priority: i64 },
    ItemStarted { item_id: String },
    ItemCompleted { item_id: String },
    ItemFailed { item_id: String, will_retry: bool },
}

/// Request outcome events emitted by any remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Request completed successfully.
    Success {
        /// Time taken to complete the request
        duration: Duration,
    },
    /// Request failed with an error.
    Failure {
        /// Time taken before failure
        duration: Duration,
    },
}

impl fmt::Display for RuntimeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeEvent::Kernel(event) => write!(f, "Kernel::{}", event),
            RuntimeEvent::Polling(event) => write!(f, "Polling::{}", event),
            RuntimeEvent::Queue(event) => write!(f, "Queue::{}", event),
            RuntimeEvent::Request(event) => write!(f, "Request::{}", event),
        }
    }
}

impl fmt::Display for KernelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelEvent::Retry(event) => write!(f, "Retry::{}", event),
            KernelEvent::CircuitBreaker(event) => write!(f, "CircuitBreaker::{}", event),
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { attempt, delay } => {
                write!(f, "Attempt(#{}, delay={:?})", attempt, delay)
            }
            RetryEvent::Exhausted { total_attempts, total_duration } => {
                write!(f, "Exhausted(attempts={}, duration={:?})", total_attempts, total_duration)
            }
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { failure_count } => {
                write!(f, "Opened(failures={})", failure_count)
            }
            CircuitBreakerEvent::HalfOpen => write!(f, "HalfOpen"),
            CircuitBreakerEvent::Closed => write!(f, "Closed"),
        }
    }
}

impl fmt::Display for PollingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollingEvent::SessionStarted { execution_id } => write!(f, "SessionStarted({})", execution_id),
            PollingEvent::PollSucceeded { execution_id, status, interval } => {
                write!(f, "PollSucceeded({}, status={}, next={:?})", execution_id, status, interval)
            }
            PollingEvent::PollFailed { execution_id, consecutive_errors } => {
                write!(f, "PollFailed({}, consecutive={})", execution_id, consecutive_errors)
            }
            PollingEvent::SessionStopped { execution_id } => write!(f, "SessionStopped({})", execution_id),
        }
    }
}

impl fmt::Display for QueueRuntimeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueRuntimeEvent::ItemEnqueued { item_id, priority } => write!(f, "ItemEnqueued({}, priority={})", item_id, priority),
            QueueRuntimeEvent::ItemStarted { item_id } => write!(f, "ItemStarted({})", item_id),
            QueueRuntimeEvent::ItemCompleted { item_id } => write!(f, "ItemCompleted({})", item_id),
            QueueRuntimeEvent::ItemFailed { item_id, will_retry } => write!(f, "ItemFailed({}, will_retry={})", item_id, will_retry),
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { duration } => write!(f, "Success(duration={:?})", duration),
            RequestOutcome::Failure { duration } => write!(f, "Failure(duration={:?})", duration),
        }
    }
}

#[cfg_attr(not(feature = "telemetry-json"), allow(dead_code))]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a `RuntimeEvent` into a JSON value for sinks.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &RuntimeEvent) -> serde_json::Value {
    match event {
        RuntimeEvent::Kernel(KernelEvent::Retry(r)) => match r {
            RetryEvent::Attempt { attempt, delay } => json!({
                "kind": "retry_attempt",
                "attempt": *attempt,
                "delay_ms": clamp_u64(delay.as_millis()),
            }),
            RetryEvent::Exhausted { total_attempts, total_duration } => json!({
                "kind": "retry_exhausted",
                "attempts": *total_attempts,
                "duration_ms": clamp_u64(total_duration.as_millis()),
            }),
        },
        RuntimeEvent::Kernel(KernelEvent::CircuitBreaker(c)) => match c {
            CircuitBreakerEvent::Opened { failure_count } => {
                json!({ "kind": "circuit_opened", "failures": *failure_count })
            }
            CircuitBreakerEvent::HalfOpen => json!({ "kind": "circuit_half_open" }),
            CircuitBreakerEvent::Closed => json!({ "kind": "circuit_closed" }),
        },
        RuntimeEvent::Polling(p) => match p {
            PollingEvent::SessionStarted { execution_id } => json!({
                "kind": "poll_session_started",
                "execution_id": execution_id,
            }),
            PollingEvent::PollSucceeded { execution_id, status, interval } => json!({
                "kind": "poll_succeeded",
                "execution_id": execution_id,
                "status": status,
                "next_interval_ms": clamp_u64(interval.as_millis()),
            }),
            PollingEvent::PollFailed { execution_id, consecutive_errors } => json!({
                "kind": "poll_failed",
                "execution_id": execution_id,
                "consecutive_errors": *consecutive_errors,
            }),
            PollingEvent::SessionStopped { execution_id } => json!({
                "kind": "poll_session_stopped",
                "execution_id": execution_id,
            }),
        },
        RuntimeEvent::Queue(q) => match q {
            QueueRuntimeEvent::ItemEnqueued { item_id, priority } => json!({
                "kind": "queue_item_enqueued",
                "item_id": item_id,
                "priority": *priority,
            }),
            QueueRuntimeEvent::ItemStarted { item_id } => json!({
                "kind": "queue_item_started",
                "item_id": item_id,
            }),
            QueueRuntimeEvent::ItemCompleted { item_id } => json!({
                "kind": "queue_item_completed",
                "item_id": item_id,
            }),
            QueueRuntimeEvent::ItemFailed { item_id, will_retry } => json!({
                "kind": "queue_item_failed",
                "item_id": item_id,
                "will_retry": *will_retry,
            }),
        },
        RuntimeEvent::Request(r) => match r {
            RequestOutcome::Success { duration } => json!({
                "kind": "request_success",
                "duration_ms": clamp_u64(duration.as_millis())
            }),
            RequestOutcome::Failure { duration } => json!({
                "kind": "request_failure",
                "duration_ms": clamp_u64(duration.as_millis())
            }),
        },
    }
}
