//! Hot sources (spec §9): publication points that broadcast to every
//! current subscriber. `LatestValue<T>` additionally replays its current
//! value to a new subscriber (a "latest-value holder"); `EventBus<T>` does
//! not — it is a pure broadcast with no replay slot.
//!
//! Grounded on the teacher's `StreamingSink` (`tokio::sync::broadcast` plus
//! a dropped-count counter) for the broadcast half, and `Adaptive<T>` for
//! the replay-on-subscribe half of `LatestValue`.

use crate::adaptive::Adaptive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::StreamExt;

/// A single-slot, atomically-updated value that fans out on change and
/// replays its current value to new subscribers (spec §9 "latest-value
/// holder"). Used for `executionState$`, `config$`, `connectionState$`,
/// and `metrics$`.
#[derive(Clone)]
pub struct LatestValue<T> {
    snapshot: Adaptive<T>,
    sender: watch::Sender<()>,
}

impl<T: Clone + Send + Sync + 'static> LatestValue<T> {
    pub fn new(initial: T) -> Self {
        let (sender, _) = watch::channel(());
        Self { snapshot: Adaptive::new(initial), sender }
    }

    /// Current value without subscribing.
    pub fn get(&self) -> Arc<T> {
        self.snapshot.get()
    }

    /// Replace the current value and notify subscribers.
    pub fn set(&self, value: T) {
        self.snapshot.set(value);
        let _ = self.sender.send(());
    }

    /// Update the current value via a closure and notify subscribers.
    pub fn update<F: FnOnce(&T) -> T>(&self, f: F) {
        self.snapshot.update(f);
        let _ = self.sender.send(());
    }

    /// Subscribe to a stream of snapshots: the current value immediately,
    /// then one snapshot per subsequent change.
    pub fn watch(&self) -> impl tokio_stream::Stream<Item = Arc<T>> {
        let snapshot = self.snapshot.clone();
        let receiver = self.sender.subscribe();
        let initial = snapshot.get();
        let rest = WatchStream::new(receiver).map(move |_| snapshot.get());
        tokio_stream::once(initial).chain(rest)
    }
}

/// An ephemeral broadcast bus with no replay slot (spec §9). Used for
/// `workflowEvents$` and `errors$`.
#[derive(Clone)]
pub struct EventBus<T> {
    sender: Arc<broadcast::Sender<T>>,
    dropped: Arc<AtomicU64>,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender: Arc::new(sender), dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Publish an event. If no subscriber is attached the event is simply
    /// dropped by the broadcast channel; a full channel drops the oldest
    /// message for lagging subscribers (broadcast semantics), which is
    /// surfaced via `dropped_count` on next receive as a `RecvError::Lagged`.
    pub fn publish(&self, event: T) {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Subscribe with the raw broadcast receiver, surfacing lag as
    /// `RecvError::Lagged` rather than silently skipping it. For callers
    /// (e.g. cache `watch`) that want to decide how to handle lag.
    pub fn subscribe_raw(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Subscribe to a stream of future events. Lag is surfaced as an `Err`
    /// in the underlying receiver; callers that need strict delivery should
    /// handle `Err` explicitly rather than via this convenience stream,
    /// which simply skips lagged gaps.
    pub fn subscribe(&self) -> impl tokio_stream::Stream<Item = T>
    where
        T: Clone,
    {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|r| r.ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_value_replays_current_value_to_new_subscriber() {
        let lv = LatestValue::new(1);
        let mut stream = Box::pin(lv.watch());
        assert_eq!(*stream.next().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn latest_value_fans_out_on_change() {
        let lv = LatestValue::new(1);
        let mut stream = Box::pin(lv.watch());
        assert_eq!(*stream.next().await.unwrap(), 1);
        lv.set(2);
        assert_eq!(*stream.next().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn latest_value_update_applies_closure() {
        let lv = LatestValue::new(10);
        lv.update(|v| v + 5);
        assert_eq!(*lv.get(), 15);
    }

    #[tokio::test]
    async fn event_bus_delivers_to_active_subscriber() {
        let bus: EventBus<i32> = EventBus::new(16);
        let mut stream = Box::pin(bus.subscribe());
        bus.publish(42);
        assert_eq!(stream.next().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn event_bus_has_no_replay_for_late_subscribers() {
        let bus: EventBus<i32> = EventBus::new(16);
        bus.publish(1);
        let mut stream = Box::pin(bus.subscribe());
        bus.publish(2);
        assert_eq!(stream.next().await.unwrap(), 2);
    }
}
