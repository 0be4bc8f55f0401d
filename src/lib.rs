#![forbid(unsafe_code)]

//! # workflow-runtime
//!
//! A resilient, reactive client for a remote workflow-automation engine:
//! an error kernel (retry + circuit breaker), an adaptive polling engine,
//! an execution cache, a priority work queue, and a resilient-stream
//! wrapper, all composed behind a reactive client that publishes state
//! and events rather than returning bare futures.
//!
//! ## Features
//!
//! - **Error kernel**: classification, exponential backoff with jitter,
//!   and a circuit breaker, fused into one retry loop
//! - **Adaptive polling**: fixed/adaptive/smart/hybrid cadence strategies
//!   that widen as an execution ages or the error rate climbs
//! - **Reactive client**: `start_workflow`/`poll_execution_status`/
//!   `resume_workflow`/`cancel_workflow`/`watch_execution`, plus composite
//!   operations (batch, race, zip, sequential, throttled)
//! - **Execution cache**: TTL-bounded, with invalidation and a `watch`
//!   stream
//! - **Work queue**: priority-ordered, throttled or bounded-concurrency
//!   dispatch with retry-on-failure
//! - **Resilient stream wrapper**: restart/retry/fallback/skip/escalate
//!   recovery policies with health-triggered forced restarts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use workflow_runtime::{ClientConfig, Kernel, PollingConfig, PollingEngine, ReactiveClient, RetryPolicy};
//! use workflow_runtime::clock::MonotonicClock;
//! use std::sync::Arc;
//!
//! # struct MyTransport;
//! # #[async_trait::async_trait]
//! # impl workflow_runtime::EngineTransport for MyTransport {
//! #     async fn post(&self, _: &str, _: &workflow_runtime::Headers, _: &[u8], _: std::time::Duration) -> Result<workflow_runtime::RawResponse, workflow_runtime::EngineError> { unimplemented!() }
//! #     async fn get(&self, _: &str, _: &workflow_runtime::Headers, _: std::time::Duration) -> Result<workflow_runtime::RawResponse, workflow_runtime::EngineError> { unimplemented!() }
//! #     async fn delete(&self, _: &str, _: &workflow_runtime::Headers, _: std::time::Duration) -> Result<workflow_runtime::RawResponse, workflow_runtime::EngineError> { unimplemented!() }
//! # }
//! #[tokio::main]
//! async fn main() {
//!     let kernel = Arc::new(Kernel::new(RetryPolicy::default()));
//!     let poller = Arc::new(PollingEngine::new(PollingConfig::default(), Arc::new(MonotonicClock::default())));
//!     let transport = Arc::new(MyTransport);
//!     let client = ReactiveClient::new(transport, ClientConfig::default(), kernel, poller);
//!     let _ = client; // wire up start_workflow/poll_execution_status/... from here
//! }
//! ```

pub mod adaptive;
pub mod backoff;
pub mod cache;
pub mod circuit_breaker;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod hotsource;
pub mod jitter;
pub mod kernel;
pub mod model;
pub mod polling;
pub mod queue;
pub mod resilient_stream;
pub mod sleeper;
pub mod telemetry;
pub mod transport;

pub mod prelude;

pub use adaptive::Adaptive;
pub use cache::{CacheEvent, CacheMetrics, ExecutionCache};
pub use circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::{ClientConfig, ConnectionState, PollUpdate, ReactiveClient, WorkflowEvent};
pub use clock::Clock;
pub use config::{ConfigError, RuntimeConfig};
pub use error::{EngineError, ErrorKind};
pub use hotsource::{EventBus, LatestValue};
pub use kernel::{Kernel, OperationStats, RetryPolicy};
pub use model::{
    CachedExecution, ExecutionId, OpaqueMap, PerformanceMetrics, PollingMetrics, QueueItemStatus,
    QueuedItem, Status, WaitNodeData, WorkflowExecution,
};
pub use polling::{PollOutcome, PollingConfig, PollingEngine, PollingMetricsSnapshot, PollingStrategy};
pub use queue::{QueueConfig, QueueDiscipline, QueueError, QueueMetrics, WorkQueue};
pub use resilient_stream::{RecoveryOutcome, RecoveryPolicy, RecoveryStrategy, ResilientStream, StreamHealth};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use transport::{build_headers, classify_status, parse_retry_after, EngineTransport, Headers, RawResponse};
