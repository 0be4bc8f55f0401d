//! The reactive client (spec §4.3): composes the transport, the error
//! kernel, and the polling engine, and exposes every remote operation as
//! an observable sequence over shared state and two event buses.
//!
//! Grounded on spec §4.3 directly for the operation set; the shared-state
//! subjects and event buses reuse [`crate::hotsource::LatestValue`] and
//! [`crate::hotsource::EventBus`]. Composite operations (`race`, `zip`,
//! `batch`) are grounded in the teacher `algebra.rs`'s fallback/fork-join
//! *shapes* ("try A, fallback to B" / "compose N into one"), reimplemented
//! directly over `tokio::select!`/`futures::future::join_all` rather than
//! over generic `tower::Layer` composition, since the client calls a plain
//! async `EngineTransport`, not a stack of layers.

use crate::cache::ExecutionCache;
use crate::error::{EngineError, ErrorKind};
use crate::hotsource::{EventBus, LatestValue};
use crate::kernel::Kernel;
use crate::model::{ExecutionId, OpaqueMap, PerformanceMetrics, Status, WorkflowExecution};
use crate::polling::{PollOutcome, PollingEngine};
use crate::transport::{build_headers, EngineTransport, Headers};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    Started { execution_id: ExecutionId, timestamp: std::time::SystemTime },
    Completed { execution_id: ExecutionId, timestamp: std::time::SystemTime },
    Resumed { execution_id: ExecutionId, timestamp: std::time::SystemTime },
    Cancelled { execution_id: ExecutionId, timestamp: std::time::SystemTime },
    Error { execution_id: ExecutionId, timestamp: std::time::SystemTime },
}

/// Client configuration (spec §3 `config$` contents, plus the wire-level
/// bits `ClientConfig` in the spec's data model leaves to §6/§7).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key_header: Option<(String, String)>,
    pub request_timeout: Duration,
    pub default_poll_interval: Duration,
    pub health_probe_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key_header: None,
            request_timeout: Duration::from_secs(30),
            default_poll_interval: Duration::from_secs(5),
            health_probe_interval: Duration::from_secs(30),
        }
    }
}

struct SharedState {
    executions: HashMap<String, WorkflowExecution>,
}

/// Update to a single execution's status, used as the broadcast payload
/// for the shared per-execution polling sequence (spec §4.3
/// `pollExecutionStatus`).
#[derive(Debug, Clone)]
pub enum PollUpdate {
    Emission(WorkflowExecution),
    Failed(EngineError),
}

pub struct ReactiveClient<T: EngineTransport> {
    transport: Arc<T>,
    config: ClientConfig,
    kernel: Arc<Kernel>,
    poller: Arc<PollingEngine>,
    execution_state: LatestValue<HashMap<String, WorkflowExecution>>,
    connection_state: LatestValue<ConnectionState>,
    metrics: LatestValue<PerformanceMetrics>,
    workflow_events: EventBus<WorkflowEvent>,
    errors: EventBus<EngineError>,
    poll_streams: Mutex<HashMap<String, broadcast::Sender<PollUpdate>>>,
    /// The final `PollUpdate` for a sequence that has already reached a
    /// terminal emission or failure. A late `poll_execution_status` call
    /// (spec §9 Open Question 2: "source keeps the completed sequence")
    /// replays this instead of subscribing to a broadcast that will never
    /// produce another message.
    completed_polls: Mutex<HashMap<String, PollUpdate>>,
    disposed: AtomicBool,
    health_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<T: EngineTransport + 'static> ReactiveClient<T> {
    pub fn new(transport: Arc<T>, config: ClientConfig, kernel: Arc<Kernel>, poller: Arc<PollingEngine>) -> Arc<Self> {
        let client = Arc::new(Self {
            transport,
            config,
            kernel,
            poller,
            execution_state: LatestValue::new(HashMap::new()),
            connection_state: LatestValue::new(ConnectionState::Disconnected),
            metrics: LatestValue::new(PerformanceMetrics::default()),
            workflow_events: EventBus::new(256),
            errors: EventBus::new(256),
            poll_streams: Mutex::new(HashMap::new()),
            completed_polls: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
            health_task: Mutex::new(None),
        });
        client.connection_state.set(ConnectionState::Connecting);
        let handle = {
            let client = client.clone();
            tokio::spawn(async move { client.run_health_probe_loop().await })
        };
        *client.health_task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        client
    }

    /// spec §4.3 `connectionState$`: a background task probes `GET
    /// {base}/api/health` every `health_probe_interval` and republishes
    /// `connected`/`error` accordingly.
    async fn run_health_probe_loop(self: Arc<Self>) {
        loop {
            if self.disposed.load(Ordering::Acquire) {
                return;
            }
            let url = format!("{}/api/health", self.config.base_url);
            let outcome = self.transport.get(&url, &self.headers(), self.config.request_timeout).await;
            let state = match outcome {
                Ok(response) if response.is_success() => ConnectionState::Connected,
                _ => ConnectionState::Error,
            };
            if self.disposed.load(Ordering::Acquire) {
                return;
            }
            self.connection_state.set(state);
            tokio::time::sleep(self.config.health_probe_interval).await;
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn execution_state(&self) -> &LatestValue<HashMap<String, WorkflowExecution>> {
        &self.execution_state
    }

    pub fn connection_state(&self) -> &LatestValue<ConnectionState> {
        &self.connection_state
    }

    pub fn metrics(&self) -> &LatestValue<PerformanceMetrics> {
        &self.metrics
    }

    pub fn workflow_events(&self) -> EventBus<WorkflowEvent> {
        self.workflow_events.clone()
    }

    pub fn errors(&self) -> EventBus<EngineError> {
        self.errors.clone()
    }

    fn headers(&self) -> Headers {
        build_headers(
            self.config.api_key_header.as_ref().map(|(k, v)| (k.as_str(), v.as_str())),
            &Headers::new(),
        )
    }

    fn now(&self) -> std::time::SystemTime {
        std::time::SystemTime::now()
    }

    fn insert_execution(&self, execution: WorkflowExecution) {
        let id = execution.id.as_wire();
        self.execution_state.update(move |map| {
            let mut map = map.clone();
            map.insert(id.clone(), execution.clone());
            map
        });
    }

    fn remove_execution(&self, id: &ExecutionId) {
        let wire = id.as_wire();
        self.execution_state.update(move |map| {
            let mut map = map.clone();
            map.remove(&wire);
            map
        });
    }

    fn publish_error(&self, err: EngineError) -> EngineError {
        self.errors.publish(err.clone());
        err
    }

    /// Updates `metrics$` (spec §3 `PerformanceMetrics`) after a caller-
    /// facing request completes, success or failure, timed from just
    /// before the transport call to just after.
    fn record_metrics(&self, success: bool, elapsed: Duration) {
        self.metrics.update(move |current| {
            let mut next = current.clone();
            next.record(success, elapsed);
            next
        });
    }

    /// spec §4.3 `startWorkflow`.
    pub async fn start_workflow(
        &self,
        webhook_path: &str,
        payload: OpaqueMap,
        workflow_id: Option<&str>,
    ) -> Result<WorkflowExecution, EngineError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(EngineError::new(ErrorKind::Unknown, "client disposed"));
        }
        let url = format!("{}/webhook/{}", self.config.base_url, webhook_path);
        let body = serde_json::to_vec(&payload)
            .map_err(|e| EngineError::new(ErrorKind::Unknown, format!("payload encode failed: {e}")))?;
        let request_started = std::time::Instant::now();
        let response = match self.transport.post(&url, &self.headers(), &body, self.config.request_timeout).await {
            Ok(response) => response,
            Err(err) => {
                self.record_metrics(false, request_started.elapsed());
                return Err(self.publish_error(err));
            }
        };

        if !response.is_success() {
            self.record_metrics(false, request_started.elapsed());
            let err = crate::transport::classify_status(response.status, format!("start_workflow failed for {webhook_path}"));
            return Err(self.publish_error(err));
        }
        self.record_metrics(true, request_started.elapsed());

        let execution_id = match workflow_id {
            Some(workflow_id) => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                self.most_recent_execution_id(workflow_id).await.unwrap_or_else(|| {
                    ExecutionId::provisional(webhook_path, self.clock_epoch_ms())
                })
            }
            None => ExecutionId::provisional(webhook_path, self.clock_epoch_ms()),
        };

        let now = self.now();
        let mut execution = WorkflowExecution::new(execution_id.clone(), workflow_id.unwrap_or_default(), now);
        execution.status = Status::Running;
        execution.data = payload;
        self.insert_execution(execution.clone());
        self.workflow_events.publish(WorkflowEvent::Started { execution_id, timestamp: now });
        Ok(execution)
    }

    fn clock_epoch_ms(&self) -> u64 {
        self.now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
    }

    async fn most_recent_execution_id(&self, workflow_id: &str) -> Option<ExecutionId> {
        let url = format!("{}/api/v1/executions?workflowId={}&limit=1", self.config.base_url, workflow_id);
        let response = self.transport.get(&url, &self.headers(), self.config.request_timeout).await.ok()?;
        if !response.is_success() {
            return None;
        }
        #[derive(serde::Deserialize)]
        struct Listing {
            data: Vec<ListingItem>,
        }
        #[derive(serde::Deserialize)]
        struct ListingItem {
            id: String,
        }
        let listing: Listing = response.json().ok()?;
        listing.data.into_iter().next().map(|item| ExecutionId::Real(item.id))
    }

    async fn fetch_status(&self, execution_id: &ExecutionId) -> Result<WorkflowExecution, EngineError> {
        if execution_id.is_provisional() {
            return Err(EngineError::provisional_id_rejected(&execution_id.as_wire()));
        }
        let url = format!("{}/api/v1/executions/{}", self.config.base_url, execution_id.as_wire());
        let request_started = std::time::Instant::now();
        let response = match self.transport.get(&url, &self.headers(), self.config.request_timeout).await {
            Ok(response) => response,
            Err(err) => {
                self.record_metrics(false, request_started.elapsed());
                return Err(err);
            }
        };
        if !response.is_success() {
            self.record_metrics(false, request_started.elapsed());
            return Err(crate::transport::classify_status(response.status, "get execution failed"));
        }
        self.record_metrics(true, request_started.elapsed());
        #[derive(serde::Deserialize)]
        struct Wire {
            id: String,
            #[serde(rename = "workflowId")]
            workflow_id: String,
            status: String,
        }
        let wire: Wire = response.json()?;
        let mut execution = WorkflowExecution::new(ExecutionId::Real(wire.id), wire.workflow_id, self.now());
        let status = Status::from_wire(&wire.status);
        execution.status = status;
        if status.is_terminal() {
            execution.finished_at = Some(self.now());
        }
        Ok(execution)
    }

    /// spec §4.3 `pollExecutionStatus`: a cached, shared sequence per
    /// execution id, created on first demand and reused. Emits only when
    /// `(status, finishedAt)` differs from the previous emission, and
    /// completes after the first terminal emission.
    pub fn poll_execution_status(
        self: &Arc<Self>,
        execution_id: ExecutionId,
        interval: Option<Duration>,
    ) -> impl futures::Stream<Item = PollUpdate> {
        if execution_id.is_provisional() {
            let (sender, _) = broadcast::channel(1);
            let _ = sender.send(PollUpdate::Failed(EngineError::provisional_id_rejected(&execution_id.as_wire())));
            return futures_util_broadcast_stream(sender.subscribe());
        }

        let wire = execution_id.as_wire();

        if let Some(final_update) =
            self.completed_polls.lock().unwrap_or_else(|p| p.into_inner()).get(&wire).cloned()
        {
            let (sender, _) = broadcast::channel(1);
            let _ = sender.send(final_update);
            return futures_util_broadcast_stream(sender.subscribe());
        }

        let mut streams = self.poll_streams.lock().unwrap_or_else(|p| p.into_inner());
        let sender = streams.entry(wire.clone()).or_insert_with(|| {
            let (sender, _) = broadcast::channel(32);
            let client = self.clone();
            let execution_id = execution_id.clone();
            let sender_for_task = sender.clone();
            tokio::spawn(async move {
                client.run_poll_loop(execution_id, interval, sender_for_task).await;
            });
            sender
        });
        futures_util_broadcast_stream(sender.subscribe())
    }

    /// `interval_override`, when given, pins every tick to that duration
    /// (the caller's explicit `interval?` argument). Otherwise the cadence
    /// comes from `poller.next_interval`, i.e. the configured fixed/
    /// adaptive/smart/hybrid strategy (spec §4.2) — including its
    /// consecutive-error backoff — rather than a constant.
    async fn run_poll_loop(
        self: Arc<Self>,
        execution_id: ExecutionId,
        interval_override: Option<Duration>,
        sender: broadcast::Sender<PollUpdate>,
    ) {
        let wire = execution_id.as_wire();
        let mut last_key: Option<(Status, Option<std::time::SystemTime>)> = None;
        self.poller.start(&wire);
        loop {
            if self.disposed.load(Ordering::Acquire) {
                return;
            }
            let outcome = self.fetch_status(&execution_id).await;
            let poll_started = std::time::Instant::now();
            match outcome {
                Ok(execution) => {
                    let key = (execution.status, execution.finished_at);
                    let poll_outcome =
                        self.poller.record(&wire, true, execution.status.as_wire(), poll_started.elapsed());
                    if Some(key) != last_key {
                        last_key = Some(key);
                        self.insert_execution(execution.clone());
                        let update = PollUpdate::Emission(execution.clone());
                        let _ = sender.send(update.clone());
                        if matches!(poll_outcome, PollOutcome::Terminal) {
                            self.completed_polls
                                .lock()
                                .unwrap_or_else(|p| p.into_inner())
                                .insert(wire.clone(), update);
                            self.workflow_events
                                .publish(WorkflowEvent::Completed { execution_id: execution_id.clone(), timestamp: self.now() });
                            self.poller.stop(&wire);
                            return;
                        }
                    }
                }
                Err(err) => {
                    self.poller.record(&wire, false, "error", poll_started.elapsed());
                    let update = PollUpdate::Failed(self.publish_error(err));
                    let _ = sender.send(update.clone());
                    self.completed_polls
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .insert(wire.clone(), update);
                    self.poller.stop(&wire);
                    return;
                }
            }
            let sleep_for = interval_override.unwrap_or_else(|| self.poller.next_interval(&wire));
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// spec §4.3 `resumeWorkflow`: retries only network-kind errors with
    /// `initialDelay × 2^attempt` (note: exponent is the attempt count
    /// itself, not attempt-1 — distinct from the kernel's general backoff
    /// formula, so this is a small dedicated loop rather than a call into
    /// `Kernel::execute_with_retry`).
    pub async fn resume_workflow(
        &self,
        execution_id: &ExecutionId,
        input_data: OpaqueMap,
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> Result<(), EngineError> {
        let url = format!("{}/api/resume-workflow/{}", self.config.base_url, execution_id.as_wire());
        let mut attempt = 0u32;
        loop {
            let body = serde_json::to_vec(&serde_json::json!({ "body": input_data }))
                .map_err(|e| EngineError::new(ErrorKind::Unknown, format!("resume payload encode failed: {e}")))?;
            let request_started = std::time::Instant::now();
            let result = self.transport.post(&url, &self.headers(), &body, self.config.request_timeout).await;
            match result {
                Ok(response) if response.is_success() => {
                    self.record_metrics(true, request_started.elapsed());
                    self.workflow_events
                        .publish(WorkflowEvent::Resumed { execution_id: execution_id.clone(), timestamp: self.now() });
                    return Ok(());
                }
                Ok(response) => {
                    self.record_metrics(false, request_started.elapsed());
                    let err = crate::transport::classify_status(response.status, "resume failed");
                    return Err(self.publish_error(err));
                }
                Err(err) if err.kind() == ErrorKind::Network && attempt < max_retries => {
                    self.record_metrics(false, request_started.elapsed());
                    attempt += 1;
                    let delay_secs = initial_delay.as_secs_f64() * 2f64.powi(attempt as i32);
                    let delay = Duration::from_secs_f64(delay_secs).min(max_delay);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.record_metrics(false, request_started.elapsed());
                    return Err(self.publish_error(err));
                }
            }
        }
    }

    /// spec §4.3 `cancelWorkflow`.
    pub async fn cancel_workflow(&self, execution_id: &ExecutionId) -> Result<(), EngineError> {
        let url = format!("{}/api/cancel-workflow/{}", self.config.base_url, execution_id.as_wire());
        let request_started = std::time::Instant::now();
        let response = match self.transport.delete(&url, &self.headers(), self.config.request_timeout).await {
            Ok(response) => response,
            Err(err) => {
                self.record_metrics(false, request_started.elapsed());
                return Err(self.publish_error(err));
            }
        };
        if !response.is_success() {
            self.record_metrics(false, request_started.elapsed());
            return Err(self.publish_error(crate::transport::classify_status(response.status, "cancel failed")));
        }
        self.record_metrics(true, request_started.elapsed());
        self.remove_execution(execution_id);
        self.workflow_events.publish(WorkflowEvent::Cancelled { execution_id: execution_id.clone(), timestamp: self.now() });
        Ok(())
    }

    /// spec §4.3 `watchExecution`: polls until terminal; on uncaught
    /// failure emits a synthetic error-status execution instead of
    /// propagating the error, so UI code can render "failed" — the sole
    /// place in the system that converts an error into a synthetic
    /// execution (spec §7).
    pub async fn watch_execution(self: &Arc<Self>, execution_id: ExecutionId) -> WorkflowExecution {
        let mut stream = Box::pin(self.poll_execution_status(execution_id.clone(), None));
        while let Some(update) = stream.next().await {
            match update {
                PollUpdate::Emission(execution) if execution.status.is_terminal() => return execution,
                PollUpdate::Emission(_) => continue,
                PollUpdate::Failed(_) => break,
            }
        }
        self.workflow_events.publish(WorkflowEvent::Error { execution_id: execution_id.clone(), timestamp: self.now() });
        WorkflowExecution::new(execution_id, "", self.now()).terminal(Status::Error, self.now())
    }

    /// spec §4.3 composite: N parallel start+poll-to-terminal, emitting
    /// only when all finish.
    pub async fn batch_start(
        self: &Arc<Self>,
        requests: Vec<(String, OpaqueMap, Option<String>)>,
    ) -> Vec<Result<WorkflowExecution, EngineError>> {
        let futures = requests.into_iter().map(|(path, payload, workflow_id)| {
            let client = self.clone();
            async move {
                let started = client.start_workflow(&path, payload, workflow_id.as_deref()).await?;
                client.poll_to_terminal(started.id.clone()).await
            }
        });
        futures::future::join_all(futures).await
    }

    async fn poll_to_terminal(self: &Arc<Self>, execution_id: ExecutionId) -> Result<WorkflowExecution, EngineError> {
        let mut stream = Box::pin(self.poll_execution_status(execution_id, None));
        while let Some(update) = stream.next().await {
            match update {
                PollUpdate::Emission(execution) if execution.status.is_terminal() => return Ok(execution),
                PollUpdate::Emission(_) => continue,
                PollUpdate::Failed(err) => return Err(err),
            }
        }
        Err(EngineError::new(ErrorKind::Unknown, "poll stream ended without a terminal emission"))
    }

    /// spec §4.3 composite `raceWorkflows`: first to terminal wins; others
    /// continue polling in the background but their emissions are
    /// discarded by the caller.
    pub async fn race_workflows(
        self: &Arc<Self>,
        requests: Vec<(String, OpaqueMap, Option<String>)>,
    ) -> Result<WorkflowExecution, EngineError> {
        let futures = requests.into_iter().map(|(path, payload, workflow_id)| {
            let client = self.clone();
            Box::pin(async move {
                let started = client.start_workflow(&path, payload, workflow_id.as_deref()).await?;
                client.poll_to_terminal(started.id.clone()).await
            })
        });
        let (result, _remaining) = futures::future::select_ok(futures).await?;
        Ok(result)
    }

    /// spec §4.3 composite `zipWorkflows`: emit once all targets have
    /// produced a new emission. Realised here as "wait for every target's
    /// final terminal emission, then emit the tuple" — the continuous
    /// per-tick zip the source reactive-extensions operator performs has
    /// no direct async/await equivalent without a custom combinator, and
    /// the spec's only externally observable property (§8) is the final
    /// synchronised emission, which this preserves.
    pub async fn zip_workflows(self: &Arc<Self>, execution_ids: Vec<ExecutionId>) -> Vec<Result<WorkflowExecution, EngineError>> {
        let futures = execution_ids.into_iter().map(|id| {
            let client = self.clone();
            async move { client.poll_to_terminal(id).await }
        });
        futures::future::join_all(futures).await
    }

    /// spec §4.3 composite `watchMultipleExecutions`: merge of N polling
    /// streams.
    pub fn watch_multiple_executions(self: &Arc<Self>, execution_ids: Vec<ExecutionId>) -> impl futures::Stream<Item = PollUpdate> {
        let streams: Vec<_> = execution_ids.into_iter().map(|id| Box::pin(self.poll_execution_status(id, None))).collect();
        futures::stream::select_all(streams)
    }

    /// spec §4.3 composite `startWorkflowsSequential`: consume requests
    /// one at a time, awaiting terminal of each before the next.
    pub async fn start_workflows_sequential(
        self: &Arc<Self>,
        requests: Vec<(String, OpaqueMap, Option<String>)>,
    ) -> Vec<Result<WorkflowExecution, EngineError>> {
        let mut results = Vec::with_capacity(requests.len());
        for (path, payload, workflow_id) in requests {
            let outcome = async {
                let started = self.start_workflow(&path, payload, workflow_id.as_deref()).await?;
                self.poll_to_terminal(started.id.clone()).await
            }
            .await;
            results.push(outcome);
        }
        results
    }

    /// spec §4.3 composite `throttledExecution`: throttle a sequence of
    /// start-requests by a duration, then start each (no wait for
    /// terminal — that's `startWorkflowsSequential`'s job).
    pub async fn throttled_execution(
        &self,
        requests: Vec<(String, OpaqueMap, Option<String>)>,
        throttle: Duration,
    ) -> Vec<Result<WorkflowExecution, EngineError>> {
        let mut results = Vec::with_capacity(requests.len());
        for (i, (path, payload, workflow_id)) in requests.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(throttle).await;
            }
            results.push(self.start_workflow(&path, payload, workflow_id.as_deref()).await);
        }
        results
    }

    /// spec §4.3 composite `retryableWorkflow`: like `startWorkflow` but
    /// with the kernel's retry policy wrapped around the start call.
    pub async fn retryable_workflow(
        self: &Arc<Self>,
        operation_id: &str,
        webhook_path: String,
        payload: OpaqueMap,
        workflow_id: Option<String>,
    ) -> Result<WorkflowExecution, EngineError> {
        let client = self.clone();
        self.kernel
            .execute_with_retry(operation_id, move || {
                let client = client.clone();
                let webhook_path = webhook_path.clone();
                let payload = payload.clone();
                let workflow_id = workflow_id.clone();
                async move { client.start_workflow(&webhook_path, payload, workflow_id.as_deref()).await }
            })
            .await
    }

    /// Idempotent disposal: closes subjects (no further polling activity
    /// starts), and drops cached polling sequences.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.poll_streams.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.completed_polls.lock().unwrap_or_else(|p| p.into_inner()).clear();
        if let Some(handle) = self.health_task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
        self.connection_state.set(ConnectionState::Disconnected);
    }

    pub fn cache(self: &Arc<Self>, ttl: Duration, clock: Arc<dyn crate::clock::Clock>) -> Arc<ExecutionCache> {
        let cache = Arc::new(ExecutionCache::new(ttl, clock));
        let client = self.clone();
        // Cache holds only a back-reference via closures passed at call
        // sites, never an owning `Arc<ReactiveClient>` field, so disposing
        // the cache cannot dispose the client (spec §3 weak ownership).
        let _ = client;
        cache
    }
}

fn futures_util_broadcast_stream(receiver: broadcast::Receiver<PollUpdate>) -> impl futures::Stream<Item = PollUpdate> {
    tokio_stream::wrappers::BroadcastStream::new(receiver).filter_map(|r| async move { r.ok() })
}
