//! TTL-bounded execution cache with reactive invalidation (spec §4.4).
//!
//! Sits above the reactive client: fetches through a caller-supplied async
//! fetch function (standing in for a single poll round-trip against the
//! client) rather than owning a transport handle itself.

use crate::clock::Clock;
use crate::hotsource::EventBus;
use crate::model::{CachedExecution, WorkflowExecution};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum CacheEvent {
    Hit { id: String },
    Miss { id: String },
    Expired { id: String },
    Set { id: String },
    Invalidated { id: String },
    InvalidatedAll,
    Prewarmed { count: usize },
    Cleaned { count: usize },
    Cleared,
}

#[derive(Debug, Clone, Default)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Rolling window of recent `get` outcomes (newest last), capped at
/// [`HIT_RATE_WINDOW`]. A derived read over the same hit/miss counters
/// `CacheMetrics` already tracks, not a new source of truth.
const HIT_RATE_WINDOW: usize = 100;

#[derive(Debug, Default)]
struct HitRateWindow {
    recent: std::collections::VecDeque<bool>,
}

impl HitRateWindow {
    fn record(&mut self, hit: bool) {
        if self.recent.len() == HIT_RATE_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(hit);
    }

    /// The recent-window hit rate, bucketed into a decile (0-10) rather than
    /// a raw fraction, for a host dashboard that wants a coarse trend signal
    /// rather than a number that jitters on every single request.
    fn decile(&self) -> u8 {
        if self.recent.is_empty() {
            return 0;
        }
        let hits = self.recent.iter().filter(|h| **h).count();
        let rate = hits as f64 / self.recent.len() as f64;
        (rate * 10.0).round().min(10.0) as u8
    }
}

fn execution_dedup_key(execution: &WorkflowExecution) -> (String, String) {
    (execution.id.as_wire(), execution.status.to_string())
}

struct WatchState<F> {
    cache: Arc<ExecutionCache>,
    id: String,
    fetch: Arc<F>,
    receiver: tokio::sync::broadcast::Receiver<CacheEvent>,
    last_key: Option<(String, String)>,
    emitted_initial: bool,
}

struct Inner {
    entries: HashMap<String, CachedExecution>,
    metrics: CacheMetrics,
    hit_rate_window: HitRateWindow,
}

/// A TTL-bounded, reactively-invalidated cache of [`WorkflowExecution`]s.
pub struct ExecutionCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    events: EventBus<CacheEvent>,
}

impl ExecutionCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                metrics: CacheMetrics::default(),
                hit_rate_window: HitRateWindow::default(),
            }),
            events: EventBus::new(256),
        }
    }

    fn now(&self) -> std::time::SystemTime {
        std::time::UNIX_EPOCH + Duration::from_millis(self.clock.now_millis())
    }

    pub fn events(&self) -> EventBus<CacheEvent> {
        self.events.clone()
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).metrics.clone()
    }

    /// The recent-window hit rate as a decile (0-10), for a host dashboard
    /// that wants a coarse trend signal alongside the raw lifetime counters
    /// in [`ExecutionCache::metrics`].
    pub fn hit_rate_decile(&self) -> u8 {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).hit_rate_window.decile()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).entries.len()
    }

    /// Returns the cached value if present and unexpired, otherwise fetches
    /// via `fetch`, stores it, and returns it (spec §4.4 `get`).
    pub async fn get<F, Fut>(&self, id: &str, fetch: F) -> Result<WorkflowExecution, crate::error::EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<WorkflowExecution, crate::error::EngineError>>,
    {
        let now = self.now();
        {
            let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(cached) = guard.entries.get(id) {
                if !cached.is_expired(now, self.ttl) {
                    guard.metrics.hits += 1;
                    guard.hit_rate_window.record(true);
                    self.events.publish(CacheEvent::Hit { id: id.to_string() });
                    return Ok(cached.execution.clone());
                } else {
                    guard.entries.remove(id);
                    self.events.publish(CacheEvent::Expired { id: id.to_string() });
                }
            }
            guard.metrics.misses += 1;
            guard.hit_rate_window.record(false);
        }
        self.events.publish(CacheEvent::Miss { id: id.to_string() });

        let execution = fetch().await?;
        self.set(id, execution.clone());
        Ok(execution)
    }

    /// Unconditional insert (spec §4.4 `set`).
    pub fn set(&self, id: &str, execution: WorkflowExecution) {
        let now = self.now();
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.entries.insert(id.to_string(), CachedExecution::new(execution, now));
        drop(guard);
        self.events.publish(CacheEvent::Set { id: id.to_string() });
    }

    pub fn peek(&self, id: &str) -> Option<WorkflowExecution> {
        let now = self.now();
        let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.entries.get(id).filter(|c| !c.is_expired(now, self.ttl)).map(|c| c.execution.clone())
    }

    pub fn invalidate(&self, id: &str) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.entries.remove(id);
        drop(guard);
        self.events.publish(CacheEvent::Invalidated { id: id.to_string() });
    }

    pub fn invalidate_all(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.entries.clear();
        drop(guard);
        self.events.publish(CacheEvent::InvalidatedAll);
    }

    pub fn invalidate_pattern<P: Fn(&str) -> bool>(&self, predicate: P) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let matching: Vec<String> = guard.entries.keys().filter(|id| predicate(id)).cloned().collect();
        for id in &matching {
            guard.entries.remove(id);
        }
        drop(guard);
        for id in matching {
            self.events.publish(CacheEvent::Invalidated { id });
        }
    }

    /// Best-effort parallel hydration (spec §4.4 `prewarm`). Errors from
    /// individual fetches are swallowed; callers needing per-id failure
    /// detail should use `get` directly.
    pub async fn prewarm<F, Fut>(&self, ids: &[String], fetch: F)
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<WorkflowExecution, crate::error::EngineError>>,
    {
        let mut count = 0;
        for id in ids {
            if let Ok(execution) = fetch(id.clone()).await {
                self.set(id, execution);
                count += 1;
            }
        }
        self.events.publish(CacheEvent::Prewarmed { count });
    }

    /// Evict expired entries, returning the number removed (spec §4.4
    /// `clearExpired`). Intended to also run on a background timer at a
    /// configured `cleanupInterval`; the timer itself is the caller's
    /// responsibility (it owns the cancellation per spec §9 timers rule).
    pub fn clear_expired(&self) -> usize {
        let now = self.now();
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let expired: Vec<String> =
            guard.entries.iter().filter(|(_, c)| c.is_expired(now, self.ttl)).map(|(id, _)| id.clone()).collect();
        for id in &expired {
            guard.entries.remove(id);
        }
        let count = expired.len();
        drop(guard);
        if count > 0 {
            self.events.publish(CacheEvent::Cleaned { count });
        }
        count
    }

    /// A sequence that emits the current cached value (or `None` if
    /// miss/expired), and re-fetches whenever an invalidation is signalled
    /// for `id` (spec §4.4 `watch`). Consecutive duplicate emissions (by
    /// execution id + status) are filtered.
    pub fn watch<F, Fut>(self: &Arc<Self>, id: String, fetch: F) -> impl futures::Stream<Item = Option<WorkflowExecution>>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WorkflowExecution, crate::error::EngineError>> + Send,
    {
        let cache = self.clone();
        let fetch = Arc::new(fetch);
        let receiver = self.events.subscribe_raw();
        let initial_key = cache.peek(&id).as_ref().map(execution_dedup_key);

        let state = WatchState { cache, id, fetch, receiver, last_key: initial_key, emitted_initial: false };
        futures::stream::unfold(state, |mut state| async move {
            loop {
                if !state.emitted_initial {
                    state.emitted_initial = true;
                    let current = state.cache.peek(&state.id);
                    return Some((current, state));
                }

                match state.receiver.recv().await {
                    Ok(CacheEvent::Invalidated { id: ref eid }) if *eid == state.id => {}
                    Ok(CacheEvent::InvalidatedAll) => {}
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }

                let fetched = (state.fetch)(state.id.clone()).await.ok();
                if let Some(execution) = &fetched {
                    state.cache.set(&state.id, execution.clone());
                }
                let key = fetched.as_ref().map(execution_dedup_key);
                if key == state.last_key {
                    continue;
                }
                state.last_key = key;
                return Some((fetched, state));
            }
        })
    }

    pub fn clear(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.entries.clear();
        drop(guard);
        self.events.publish(CacheEvent::Cleared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::EngineError;
    use crate::model::{ExecutionId, Status};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn execution(id: &str) -> WorkflowExecution {
        let mut e = WorkflowExecution::new(ExecutionId::Real(id.to_string()), "wf", std::time::UNIX_EPOCH);
        e.status = Status::Running;
        e
    }

    #[tokio::test]
    async fn set_then_get_within_ttl_never_calls_fetch() {
        let cache = ExecutionCache::new(Duration::from_secs(60), Arc::new(ManualClock::new()));
        cache.set("e1", execution("e1"));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result = cache
            .get("e1", || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(execution("e1"))
                }
            })
            .await
            .unwrap();
        assert_eq!(result.id, ExecutionId::Real("e1".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn miss_triggers_exactly_one_fetch() {
        let cache = ExecutionCache::new(Duration::from_secs(60), Arc::new(ManualClock::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let _ = cache
            .get("e1", || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, EngineError>(execution("e1"))
                }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.metrics().misses, 1);
    }

    #[tokio::test]
    async fn expiry_triggers_refetch_after_ttl() {
        let clock = Arc::new(ManualClock::new());
        let cache = ExecutionCache::new(Duration::from_secs(60), clock.clone());
        cache.set("e1", execution("e1"));
        clock.advance(120_000);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let _ = cache
            .get("e1", || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, EngineError>(execution("e1"))
                }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_expired_returns_count_and_evicts() {
        let clock = Arc::new(ManualClock::new());
        let cache = ExecutionCache::new(Duration::from_secs(10), clock.clone());
        cache.set("e1", execution("e1"));
        cache.set("e2", execution("e2"));
        clock.advance(20_000);
        assert_eq!(cache.clear_expired(), 2);
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn invalidate_removes_single_entry() {
        let cache = ExecutionCache::new(Duration::from_secs(60), Arc::new(ManualClock::new()));
        cache.set("e1", execution("e1"));
        cache.set("e2", execution("e2"));
        cache.invalidate("e1");
        assert!(cache.peek("e1").is_none());
        assert!(cache.peek("e2").is_some());
    }

    #[tokio::test]
    async fn invalidate_pattern_matches_by_predicate() {
        let cache = ExecutionCache::new(Duration::from_secs(60), Arc::new(ManualClock::new()));
        cache.set("wf-a-1", execution("wf-a-1"));
        cache.set("wf-b-1", execution("wf-b-1"));
        cache.invalidate_pattern(|id| id.starts_with("wf-a"));
        assert!(cache.peek("wf-a-1").is_none());
        assert!(cache.peek("wf-b-1").is_some());
    }

    #[tokio::test]
    async fn prewarm_hydrates_all_ids_best_effort() {
        let cache = ExecutionCache::new(Duration::from_secs(60), Arc::new(ManualClock::new()));
        cache
            .prewarm(&["a".to_string(), "b".to_string()], |id| async move { Ok(execution(&id)) })
            .await;
        assert_eq!(cache.size(), 2);
    }

    #[tokio::test]
    async fn watch_emits_current_value_then_refetches_on_invalidation() {
        use futures::StreamExt;

        let cache = Arc::new(ExecutionCache::new(Duration::from_secs(60), Arc::new(ManualClock::new())));
        cache.set("e1", execution("e1"));

        let fetch_calls = Arc::new(AtomicUsize::new(0));
        let fetch_calls2 = fetch_calls.clone();
        let mut stream = Box::pin(cache.watch("e1".to_string(), move |id| {
            let fetch_calls = fetch_calls2.clone();
            async move {
                fetch_calls.fetch_add(1, Ordering::SeqCst);
                let mut refetched = execution(&id);
                refetched.status = Status::Success;
                refetched.finished_at = Some(std::time::UNIX_EPOCH);
                Ok(refetched)
            }
        }));

        let first = stream.next().await.unwrap();
        assert!(first.is_some());
        assert_eq!(fetch_calls.load(Ordering::SeqCst), 0, "initial emission must not fetch");

        cache.invalidate("e1");
        let second = stream.next().await.unwrap();
        assert!(second.is_some());
        assert_eq!(fetch_calls.load(Ordering::SeqCst), 1, "invalidation must trigger exactly one refetch");
    }

    #[tokio::test]
    async fn hit_rate_reflects_hits_and_misses() {
        let cache = ExecutionCache::new(Duration::from_secs(60), Arc::new(ManualClock::new()));
        cache.set("e1", execution("e1"));
        let _ = cache.get("e1", || async { Ok::<_, EngineError>(execution("e1")) }).await;
        let _ = cache.get("e2", || async { Ok::<_, EngineError>(execution("e2")) }).await;
        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert!((metrics.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn hit_rate_decile_tracks_the_recent_window() {
        let cache = ExecutionCache::new(Duration::from_secs(60), Arc::new(ManualClock::new()));
        assert_eq!(cache.hit_rate_decile(), 0, "empty window has no trend yet");

        cache.set("e1", execution("e1"));
        for _ in 0..4 {
            let _ = cache.get("e1", || async { Ok::<_, EngineError>(execution("e1")) }).await;
        }
        assert_eq!(cache.hit_rate_decile(), 10, "all hits so far");

        for i in 0..4 {
            let id = format!("missing-{i}");
            let _ = cache.get(&id, || async move { Ok::<_, EngineError>(execution("missing")) }).await;
        }
        assert_eq!(cache.hit_rate_decile(), 5, "four hits, four misses in the window");
    }
}
