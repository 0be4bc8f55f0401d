//! The data model shared across the kernel, polling engine, reactive
//! client, cache, and queue (spec §3).

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// An execution id, either engine-assigned or a client-side placeholder
/// synthesised when the engine could not be correlated at start time.
///
/// The wire format is always a plain string (`Real` as-is, `Provisional` as
/// `webhook-<path>-<epochMs>`); this sum type exists so call sites cannot
/// accidentally attempt a status fetch on a provisional id without going
/// through [`ExecutionId::as_wire`] and the provisional check.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExecutionId {
    Real(String),
    Provisional { webhook_path: String, epoch_ms: u64 },
}

impl ExecutionId {
    pub fn provisional(webhook_path: impl Into<String>, epoch_ms: u64) -> Self {
        Self::Provisional { webhook_path: webhook_path.into(), epoch_ms }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, ExecutionId::Provisional { .. })
    }

    /// The wire-format string: `id` for a real execution, or
    /// `webhook-<path>-<epochMs>` for a provisional one.
    pub fn as_wire(&self) -> String {
        match self {
            ExecutionId::Real(id) => id.clone(),
            ExecutionId::Provisional { webhook_path, epoch_ms } => {
                format!("webhook-{webhook_path}-{epoch_ms}")
            }
        }
    }

    /// Parse a wire-format id back into the sum type. Any id starting with
    /// `webhook-` is treated as provisional (spec §6); the remainder is not
    /// re-split into path/epoch since only the wire string round-trips.
    pub fn from_wire(id: impl Into<String>) -> Self {
        let id = id.into();
        if id.starts_with("webhook-") {
            ExecutionId::Provisional { webhook_path: id, epoch_ms: 0 }
        } else {
            ExecutionId::Real(id)
        }
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_wire())
    }
}

/// Lifecycle stage of a [`WorkflowExecution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    New,
    Running,
    Waiting,
    Success,
    Error,
    Canceled,
    Crashed,
    Unknown,
}

impl Status {
    pub fn is_active(self) -> bool {
        matches!(self, Status::New | Status::Running | Status::Waiting)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            Status::New => "new",
            Status::Running => "running",
            Status::Waiting => "waiting",
            Status::Success => "success",
            Status::Error => "error",
            Status::Canceled => "canceled",
            Status::Crashed => "crashed",
            Status::Unknown => "unknown",
        }
    }

    pub fn from_wire(s: &str) -> Self {
        match s {
            "new" => Status::New,
            "running" => Status::Running,
            "waiting" => Status::Waiting,
            "success" => Status::Success,
            "error" => Status::Error,
            "canceled" => Status::Canceled,
            "crashed" => Status::Crashed,
            _ => Status::Unknown,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_wire())
    }
}

/// Opaque JSON-shaped payload. Duck-typed data at the wire edge is kept as
/// `serde_json::Value` per spec §9 rather than leaking into domain structs.
pub type OpaqueMap = HashMap<String, serde_json::Value>;

/// A form schema describing input the engine is waiting on.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitNodeData {
    pub schema: OpaqueMap,
}

/// A remote execution instance (spec §3 `WorkflowExecution`).
///
/// Invariant: a terminal `status` implies `finished_at.is_some()`; callers
/// that construct one directly (tests, synthetic error executions) are
/// responsible for upholding this — see [`WorkflowExecution::terminal`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: String,
    pub status: Status,
    pub started_at: SystemTime,
    pub finished_at: Option<SystemTime>,
    pub data: OpaqueMap,
    pub waiting_for_input: bool,
    pub wait_node_data: Option<WaitNodeData>,
}

impl WorkflowExecution {
    pub fn new(id: ExecutionId, workflow_id: impl Into<String>, started_at: SystemTime) -> Self {
        Self {
            id,
            workflow_id: workflow_id.into(),
            status: Status::New,
            started_at,
            finished_at: None,
            data: OpaqueMap::new(),
            waiting_for_input: false,
            wait_node_data: None,
        }
    }

    /// Build a terminal execution, enforcing the `finished_at` invariant.
    pub fn terminal(mut self, status: Status, finished_at: SystemTime) -> Self {
        debug_assert!(status.is_terminal(), "terminal() called with a non-terminal status");
        self.status = status;
        self.finished_at = Some(finished_at);
        self
    }
}

/// Per-execution polling counters (spec §3/§4.2). `recent_intervals` caps at
/// 20 entries (the sliding window `average_interval` is derived from).
#[derive(Debug, Clone, Default)]
pub struct PollingMetrics {
    pub total_polls: u64,
    pub successes: u64,
    pub errors: u64,
    pub total_elapsed: Duration,
    recent_intervals: std::collections::VecDeque<Duration>,
    pub status_counts: HashMap<String, u64>,
    pub started_at: Option<SystemTime>,
    pub ended_at: Option<SystemTime>,
}

const POLLING_METRICS_WINDOW: usize = 20;

impl PollingMetrics {
    pub fn record_interval(&mut self, interval: Duration) {
        if self.recent_intervals.len() == POLLING_METRICS_WINDOW {
            self.recent_intervals.pop_front();
        }
        self.recent_intervals.push_back(interval);
    }

    pub fn record_poll(&mut self, success: bool, interval: Duration, status: &str) {
        self.total_polls += 1;
        if success {
            self.successes += 1;
        } else {
            self.errors += 1;
        }
        self.total_elapsed += interval;
        self.record_interval(interval);
        *self.status_counts.entry(status.to_string()).or_insert(0) += 1;
    }

    pub fn average_interval(&self) -> Duration {
        if self.recent_intervals.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.recent_intervals.iter().sum();
        total / self.recent_intervals.len() as u32
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_polls == 0 {
            return 0.0;
        }
        self.successes as f64 / self.total_polls as f64
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_polls == 0 {
            return 0.0;
        }
        self.errors as f64 / self.total_polls as f64
    }

    pub fn freeze(&mut self, at: SystemTime) {
        self.ended_at = Some(at);
    }
}

/// A cached execution paired with its insertion timestamp (spec §3/§4.4).
#[derive(Debug, Clone)]
pub struct CachedExecution {
    pub execution: WorkflowExecution,
    pub inserted_at: SystemTime,
}

impl CachedExecution {
    pub fn new(execution: WorkflowExecution, inserted_at: SystemTime) -> Self {
        Self { execution, inserted_at }
    }

    pub fn is_expired(&self, now: SystemTime, ttl: Duration) -> bool {
        now.duration_since(self.inserted_at).map(|age| age > ttl).unwrap_or(false)
    }
}

/// Lifecycle stage of a [`QueuedItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A single work-queue entry (spec §3/§4.5).
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub id: uuid::Uuid,
    pub webhook_path: String,
    pub payload: OpaqueMap,
    pub status: QueueItemStatus,
    pub priority: i64,
    pub retry_count: u32,
    pub execution_id: Option<ExecutionId>,
    pub error: Option<crate::error::EngineError>,
    pub metadata: Option<OpaqueMap>,
    pub enqueued_at: SystemTime,
}

impl QueuedItem {
    pub fn new(webhook_path: impl Into<String>, payload: OpaqueMap, priority: i64, enqueued_at: SystemTime) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            webhook_path: webhook_path.into(),
            payload,
            status: QueueItemStatus::Pending,
            priority,
            retry_count: 0,
            execution_id: None,
            error: None,
            metadata: None,
            enqueued_at,
        }
    }
}

/// Running totals the reactive client exposes on `metrics$` (spec §3).
#[derive(Debug, Clone, Default)]
pub struct PerformanceMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    average_response_time: Duration,
}

impl PerformanceMetrics {
    pub fn record(&mut self, success: bool, response_time: Duration) {
        let previous_total = self.total_requests;
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        let previous_weighted = self.average_response_time.as_secs_f64() * previous_total as f64;
        self.average_response_time =
            Duration::from_secs_f64((previous_weighted + response_time.as_secs_f64()) / self.total_requests as f64);
    }

    pub fn average_response_time(&self) -> Duration {
        self.average_response_time
    }
}
