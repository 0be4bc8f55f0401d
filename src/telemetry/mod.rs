//! Ambient observability for the kernel, poller, and queue.
//!
//! This module provides the event system that enables those modules to
//! emit structured telemetry independent of the public reactive API
//! (`WorkflowEvent`/`EngineError`, on `ReactiveClient`). Events flow
//! through `TelemetrySink` implementations which can log, aggregate, or
//! forward events to external systems.
//!
//! # Event Types
//!
//! - **Kernel**: `RetryEvent` (attempt/exhausted), `CircuitBreakerEvent`
//!   (opened/half-open/closed)
//! - **Polling**: session started/stopped, poll succeeded/failed
//! - **Queue**: item enqueued/started/completed/failed
//! - **Any remote call**: `RequestOutcome` (success/failure)
//!
//! # Telemetry Sinks
//!
//! The `TelemetrySink` trait defines how events are consumed. It's implemented
//! as a `tower::Service<RuntimeEvent>` for composability.

pub mod events;
pub mod sinks;

pub use events::{CircuitBreakerEvent, KernelEvent, PollingEvent, QueueRuntimeEvent, RequestOutcome, RetryEvent, RuntimeEvent};
pub use sinks::{
    emit_best_effort, ComposedSinkError, FallbackSink, LogSink, MemorySink, MulticastSink,
    NonBlockingSink, NullSink, StreamingSink, TelemetrySink,
};
