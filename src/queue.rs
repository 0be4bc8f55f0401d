//! Throttled, prioritised work queue (spec §4.5): sits above the reactive
//! client, ordering start requests by priority and dispatching them under
//! a throttle or bounded-concurrency discipline.
//!
//! The concurrency gate reuses the teacher's `bulkhead.rs` semaphore
//! technique inline rather than as a standalone policy type — the spec's
//! error taxonomy has no "bulkhead rejection" kind, so there is nothing to
//! surface as an `EngineError` if a slot is unavailable; callers simply
//! wait for one.

use crate::error::EngineError;
use crate::model::{ExecutionId, OpaqueMap, QueueItemStatus, QueuedItem};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDiscipline {
    Throttled,
    Concurrent,
}

/// Work-queue configuration (spec §3 `QueueConfig`).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub discipline: QueueDiscipline,
    pub throttle_interval: Duration,
    pub max_concurrent: usize,
    pub wait_for_completion: bool,
    pub retry_failed_items: bool,
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            discipline: QueueDiscipline::Throttled,
            throttle_interval: Duration::from_secs(1),
            max_concurrent: 4,
            wait_for_completion: true,
            retry_failed_items: true,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("item {0} is currently processing and cannot be removed")]
    ItemProcessing(Uuid),
    #[error("item {0} not found")]
    NotFound(Uuid),
}

/// Monotonic insertion counter paired with each item so a stable
/// priority-descending sort breaks ties by arrival order (spec §4.5
/// "ties break by insertion order"); stored alongside the item rather than
/// on it since `QueuedItem` has no such field in the data model (spec §3).
struct Entry {
    item: QueuedItem,
    seq: u64,
}

/// Accepts workflow start requests, orders them by priority, and dispatches
/// them respecting throttle, concurrency, and retry policy.
pub struct WorkQueue {
    config: QueueConfig,
    entries: Mutex<Vec<Entry>>,
    insertion_seq: std::sync::atomic::AtomicU64,
    semaphore: Arc<Semaphore>,
    paused: AtomicBool,
}

impl WorkQueue {
    pub fn new(config: QueueConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            config,
            entries: Mutex::new(Vec::new()),
            insertion_seq: std::sync::atomic::AtomicU64::new(0),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            paused: AtomicBool::new(false),
        }
    }

    /// Stop dispatching new items without discarding already-queued ones;
    /// a host needs a safe way to quiesce a queue before shutdown. Items
    /// already `Processing` when `pause` is called run to completion.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn next_seq(&self) -> u64 {
        self.insertion_seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    fn insert_sorted(entries: &mut Vec<Entry>, entry: Entry) {
        entries.push(entry);
        entries.sort_by(|a, b| b.item.priority.cmp(&a.item.priority).then(a.seq.cmp(&b.seq)));
    }

    /// Insert one item, sorted by priority descending (spec §4.5).
    pub fn enqueue(&self, webhook_path: impl Into<String>, payload: OpaqueMap, priority: i64, enqueued_at: std::time::SystemTime) -> Uuid {
        let item = QueuedItem::new(webhook_path, payload, priority, enqueued_at);
        let id = item.id;
        let seq = self.next_seq();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        Self::insert_sorted(&mut entries, Entry { item, seq });
        id
    }

    pub fn enqueue_many(
        &self,
        items: Vec<(String, OpaqueMap, i64)>,
        enqueued_at: std::time::SystemTime,
    ) -> Vec<Uuid> {
        items
            .into_iter()
            .map(|(webhook_path, payload, priority)| self.enqueue(webhook_path, payload, priority, enqueued_at))
            .collect()
    }

    /// Remove a pending/completed/failed item. Fails if it is currently
    /// processing (spec §4.5 invariant).
    pub fn remove(&self, id: Uuid) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let index = entries.iter().position(|e| e.item.id == id).ok_or(QueueError::NotFound(id))?;
        if entries[index].item.status == QueueItemStatus::Processing {
            return Err(QueueError::ItemProcessing(id));
        }
        entries.remove(index);
        Ok(())
    }

    pub fn clear_completed(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|e| e.item.status != QueueItemStatus::Completed);
    }

    pub fn clear_failed(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|e| e.item.status != QueueItemStatus::Failed);
    }

    /// Clear the queue, preserving already-processing items to completion
    /// (spec §4.5 invariant).
    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|e| e.item.status == QueueItemStatus::Processing);
    }

    pub fn metrics(&self) -> QueueMetrics {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let mut metrics = QueueMetrics::default();
        for entry in entries.iter() {
            match entry.item.status {
                QueueItemStatus::Pending => metrics.pending += 1,
                QueueItemStatus::Processing => metrics.processing += 1,
                QueueItemStatus::Completed => metrics.completed += 1,
                QueueItemStatus::Failed => metrics.failed += 1,
            }
        }
        metrics
    }

    pub fn items_snapshot(&self) -> Vec<QueuedItem> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.iter().map(|e| e.item.clone()).collect()
    }

    fn take_next_pending(&self) -> Option<QueuedItem> {
        if self.paused.load(Ordering::Acquire) {
            return None;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let index = entries.iter().position(|e| e.item.status == QueueItemStatus::Pending)?;
        entries[index].item.status = QueueItemStatus::Processing;
        Some(entries[index].item.clone())
    }

    fn finish(&self, id: Uuid, outcome: Result<ExecutionId, EngineError>) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = entries.iter_mut().find(|e| e.item.id == id) {
            match outcome {
                Ok(execution_id) => {
                    entry.item.status = QueueItemStatus::Completed;
                    entry.item.execution_id = Some(execution_id);
                }
                Err(err) => {
                    if self.config.retry_failed_items && entry.item.retry_count < self.config.max_retries {
                        entry.item.retry_count += 1;
                        entry.item.status = QueueItemStatus::Pending;
                        entry.item.error = Some(err);
                    } else {
                        entry.item.status = QueueItemStatus::Failed;
                        entry.item.error = Some(err);
                    }
                }
            }
        }
    }

    /// Process one item via `start` (and, if `wait_for_completion` is
    /// configured, `wait_terminal`), applying the item lifecycle (spec
    /// §4.5): processing → completed | (failed | re-pending-with-retry).
    async fn process_one<S, SF, W, WF>(&self, item: QueuedItem, start: &S, wait_terminal: &W)
    where
        S: Fn(QueuedItem) -> SF,
        SF: Future<Output = Result<ExecutionId, EngineError>>,
        W: Fn(ExecutionId) -> WF,
        WF: Future<Output = Result<(), EngineError>>,
    {
        let id = item.id;
        let outcome = async {
            let execution_id = start(item).await?;
            if self.config.wait_for_completion {
                wait_terminal(execution_id.clone()).await?;
            }
            Ok(execution_id)
        }
        .await;
        self.finish(id, outcome);
    }

    /// Throttled discipline: dispatch pending items one at a time,
    /// priority-descending, no faster than `throttle_interval` apart.
    pub async fn run_throttled<S, SF, W, WF>(&self, start: S, wait_terminal: W)
    where
        S: Fn(QueuedItem) -> SF,
        SF: Future<Output = Result<ExecutionId, EngineError>>,
        W: Fn(ExecutionId) -> WF,
        WF: Future<Output = Result<(), EngineError>>,
    {
        loop {
            let Some(item) = self.take_next_pending() else { break };
            self.process_one(item, &start, &wait_terminal).await;
            tokio::time::sleep(self.config.throttle_interval).await;
        }
    }

    /// Concurrent discipline: dispatch up to `max_concurrent` top-priority
    /// pending items in parallel.
    pub async fn run_concurrent<S, SF, W, WF>(&self, start: S, wait_terminal: W)
    where
        S: Fn(QueuedItem) -> SF + Send + Sync,
        SF: Future<Output = Result<ExecutionId, EngineError>> + Send,
        W: Fn(ExecutionId) -> WF + Send + Sync,
        WF: Future<Output = Result<(), EngineError>> + Send,
    {
        let mut in_flight = Vec::new();
        loop {
            while let Some(item) = self.take_next_pending() {
                let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore never closed");
                let id = item.id;
                let started = start(item);
                let fut = async move {
                    let outcome = started.await;
                    let outcome = match outcome {
                        Ok(execution_id) => Ok(execution_id),
                        Err(e) => Err(e),
                    };
                    (id, outcome, permit)
                };
                in_flight.push(Box::pin(fut));
            }
            if in_flight.is_empty() {
                break;
            }
            let (result, _index, remaining) = futures::future::select_all(in_flight).await;
            in_flight = remaining;
            let (id, outcome, permit) = result;
            let outcome = match outcome {
                Ok(execution_id) => {
                    if self.config.wait_for_completion {
                        wait_terminal(execution_id.clone()).await.map(|_| execution_id)
                    } else {
                        Ok(execution_id)
                    }
                }
                Err(e) => Err(e),
            };
            self.finish(id, outcome);
            drop(permit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> QueueConfig {
        QueueConfig { throttle_interval: Duration::from_millis(0), wait_for_completion: false, ..QueueConfig::default() }
    }

    #[test]
    fn enqueue_sorts_by_priority_descending_ties_by_insertion_order() {
        let queue = WorkQueue::new(config());
        let now = std::time::UNIX_EPOCH;
        let a = queue.enqueue("a", OpaqueMap::new(), 1, now);
        let b = queue.enqueue("b", OpaqueMap::new(), 10, now);
        let c = queue.enqueue("c", OpaqueMap::new(), 5, now);
        let d = queue.enqueue("d", OpaqueMap::new(), 5, now);

        let ids: Vec<Uuid> = queue.items_snapshot().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![b, c, d, a]);
    }

    #[test]
    fn remove_fails_while_item_is_processing() {
        let queue = WorkQueue::new(config());
        let now = std::time::UNIX_EPOCH;
        let _ = queue.enqueue("a", OpaqueMap::new(), 1, now);
        let item = queue.take_next_pending().unwrap();
        assert!(matches!(queue.remove(item.id), Err(QueueError::ItemProcessing(_))));
    }

    #[test]
    fn clear_preserves_processing_items() {
        let queue = WorkQueue::new(config());
        let now = std::time::UNIX_EPOCH;
        let _ = queue.enqueue("a", OpaqueMap::new(), 1, now);
        let _ = queue.enqueue("b", OpaqueMap::new(), 1, now);
        let processing = queue.take_next_pending().unwrap();
        queue.clear();
        let remaining = queue.items_snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, processing.id);
    }

    #[tokio::test]
    async fn throttled_run_dispatches_in_priority_order() {
        let queue = WorkQueue::new(config());
        let now = std::time::UNIX_EPOCH;
        queue.enqueue("low", OpaqueMap::new(), 1, now);
        queue.enqueue("high", OpaqueMap::new(), 10, now);
        queue.enqueue("mid", OpaqueMap::new(), 5, now);

        let order = Arc::new(Mutex::new(Vec::new()));
        let order2 = order.clone();
        queue
            .run_throttled(
                move |item| {
                    let order = order2.clone();
                    async move {
                        order.lock().unwrap().push(item.webhook_path.clone());
                        Ok(ExecutionId::Real(format!("exec-{}", item.webhook_path)))
                    }
                },
                |_id| async { Ok(()) },
            )
            .await;

        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
        let metrics = queue.metrics();
        assert_eq!(metrics.completed, 3);
        assert_eq!(metrics.pending, 0);
    }

    #[tokio::test]
    async fn failed_item_reenters_pending_with_incremented_retry() {
        let mut cfg = config();
        cfg.max_retries = 2;
        let queue = WorkQueue::new(cfg);
        let now = std::time::UNIX_EPOCH;
        queue.enqueue("flaky", OpaqueMap::new(), 1, now);

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = attempts.clone();
        queue
            .run_throttled(
                move |_item| {
                    let attempts = attempts2.clone();
                    async move {
                        let n = attempts.fetch_add(1, Ordering::SeqCst);
                        if n < 2 {
                            Err(EngineError::new(ErrorKind::Network, "down"))
                        } else {
                            Ok(ExecutionId::Real("exec".to_string()))
                        }
                    }
                },
                |_id| async { Ok(()) },
            )
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let metrics = queue.metrics();
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.failed, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_item_failed() {
        let mut cfg = config();
        cfg.max_retries = 1;
        let queue = WorkQueue::new(cfg);
        let now = std::time::UNIX_EPOCH;
        queue.enqueue("always-fails", OpaqueMap::new(), 1, now);

        queue
            .run_throttled(
                |_item| async { Err(EngineError::new(ErrorKind::Network, "down")) },
                |_id| async { Ok(()) },
            )
            .await;

        let metrics = queue.metrics();
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.completed, 0);
    }

    #[tokio::test]
    async fn paused_queue_dispatches_nothing_until_resumed() {
        let queue = WorkQueue::new(config());
        let now = std::time::UNIX_EPOCH;
        queue.enqueue("a", OpaqueMap::new(), 1, now);
        queue.pause();
        assert!(queue.is_paused());

        queue.run_throttled(|_item| async { Ok(ExecutionId::Real("exec".to_string())) }, |_id| async { Ok(()) }).await;
        assert_eq!(queue.metrics().pending, 1, "paused queue must not dispatch");

        queue.resume();
        queue.run_throttled(|_item| async { Ok(ExecutionId::Real("exec".to_string())) }, |_id| async { Ok(()) }).await;
        assert_eq!(queue.metrics().completed, 1);
    }

    #[tokio::test]
    async fn concurrent_run_respects_max_concurrent() {
        let mut cfg = config();
        cfg.discipline = QueueDiscipline::Concurrent;
        cfg.max_concurrent = 2;
        let queue = Arc::new(WorkQueue::new(cfg));
        let now = std::time::UNIX_EPOCH;
        for i in 0..5 {
            queue.enqueue(format!("item-{i}"), OpaqueMap::new(), i, now);
        }

        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let current = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak2 = peak.clone();
        let current2 = current.clone();

        queue
            .run_concurrent(
                move |item| {
                    let peak = peak2.clone();
                    let current = current2.clone();
                    async move {
                        let now_in_flight = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now_in_flight, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(ExecutionId::Real(format!("exec-{}", item.webhook_path)))
                    }
                },
                |_id| async { Ok(()) },
            )
            .await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
