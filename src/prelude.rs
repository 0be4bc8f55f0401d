//! Convenient re-exports for common workflow-runtime types.
pub use crate::{
    adaptive::Adaptive,
    backoff,
    cache::{CacheEvent, CacheMetrics, ExecutionCache},
    circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState},
    client::{ClientConfig, ConnectionState, PollUpdate, ReactiveClient, WorkflowEvent},
    clock::{Clock, ManualClock, MonotonicClock},
    config::{ConfigError, RuntimeConfig},
    error::{ClassifyInput, EngineError, ErrorKind},
    hotsource::{EventBus, LatestValue},
    jitter,
    kernel::{Kernel, OperationStats, RetryPolicy},
    model::{
        CachedExecution, ExecutionId, OpaqueMap, PerformanceMetrics, PollingMetrics,
        QueueItemStatus, QueuedItem, Status, WaitNodeData, WorkflowExecution,
    },
    polling::{PollOutcome, PollingConfig, PollingEngine, PollingMetricsSnapshot, PollingStrategy},
    queue::{QueueConfig, QueueDiscipline, QueueError, QueueMetrics, WorkQueue},
    resilient_stream::{
        RecoveryOutcome, RecoveryPolicy, RecoveryStrategy, ResilientStream, StreamHealth,
    },
    sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper},
    telemetry::{
        emit_best_effort, CircuitBreakerEvent, FallbackSink, KernelEvent, LogSink, MemorySink,
        MulticastSink, NonBlockingSink, NullSink, PollingEvent, QueueRuntimeEvent, RequestOutcome,
        RetryEvent, RuntimeEvent, StreamingSink, TelemetrySink,
    },
    transport::{build_headers, classify_status, parse_retry_after, EngineTransport, Headers, RawResponse},
};
