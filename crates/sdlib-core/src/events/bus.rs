//! Topic-scoped, in-process publish/subscribe.
//!
//! Each subscriber owns an independent bounded buffer. Publishing never
//! blocks: when a subscriber's buffer is full the event is dropped for
//! that subscriber and its drop counter is incremented. Delivery order
//! per subscriber follows publish order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::trace;

use super::{AppEvent, Topic};

/// Default per-subscriber buffer capacity.
const DEFAULT_BUFFER: usize = 256;

struct SubscriberEntry {
    id: u64,
    topics: HashSet<Topic>,
    tx: mpsc::Sender<AppEvent>,
    dropped: Arc<AtomicU64>,
}

/// In-process event bus.
///
/// Cheap to share: wrap in `Arc` and clone the handle everywhere events
/// are published.
pub struct EventBus {
    subscribers: Mutex<Vec<SubscriberEntry>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber for a set of topics with the default buffer.
    pub fn subscribe(&self, topics: impl IntoIterator<Item = Topic>) -> Subscription {
        self.subscribe_with_capacity(topics, DEFAULT_BUFFER)
    }

    /// Register a subscriber with an explicit buffer capacity.
    pub fn subscribe_with_capacity(
        &self,
        topics: impl IntoIterator<Item = Topic>,
        capacity: usize,
    ) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let entry = SubscriberEntry {
            id,
            topics: topics.into_iter().collect(),
            tx,
            dropped: Arc::clone(&dropped),
        };
        self.subscribers.lock().expect("subscriber table poisoned").push(entry);

        Subscription { id, rx, dropped }
    }

    /// Remove a subscriber. No further events are delivered after this
    /// returns; already-buffered events remain readable.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("subscriber table poisoned")
            .retain(|entry| entry.id != id);
    }

    /// Replace the topic set of an existing subscriber.
    pub fn set_topics(&self, id: u64, topics: impl IntoIterator<Item = Topic>) {
        let mut subscribers = self.subscribers.lock().expect("subscriber table poisoned");
        if let Some(entry) = subscribers.iter_mut().find(|entry| entry.id == id) {
            entry.topics = topics.into_iter().collect();
        }
    }

    /// Publish an event to every subscriber of its topic.
    ///
    /// Never blocks. Subscribers whose receiver has been dropped are
    /// pruned; subscribers whose buffer is full miss the event and have
    /// their drop counter incremented.
    pub fn publish(&self, event: &AppEvent) {
        let topic = event.topic();
        let mut subscribers = self.subscribers.lock().expect("subscriber table poisoned");
        subscribers.retain(|entry| {
            if !entry.topics.contains(&topic) {
                return true;
            }
            match entry.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    entry.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        subscriber = entry.id,
                        event = event.event_name(),
                        "subscriber buffer full, dropping event"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("subscriber table poisoned").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription handle.
///
/// Dropping the handle ends delivery; the bus prunes the entry on the
/// next publish to the subscribed topics.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<AppEvent>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Subscriber id, usable with [`EventBus::unsubscribe`] and
    /// [`EventBus::set_topics`].
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next event, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<AppEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<AppEvent> {
        self.rx.try_recv().ok()
    }

    /// Events dropped due to buffer overflow.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn progress_event(progress: f64) -> AppEvent {
        AppEvent::JobProgress {
            job_id: Uuid::nil(),
            progress,
        }
    }

    fn model_event() -> AppEvent {
        AppEvent::ModelStateChanged {
            model_id: "m".into(),
            status: "running".into(),
            port: None,
            pid: None,
        }
    }

    #[tokio::test]
    async fn delivers_only_subscribed_topics() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe([Topic::Queue]);

        bus.publish(&model_event());
        bus.publish(&progress_event(0.1));

        let event = sub.recv().await.unwrap();
        assert!(matches!(event, AppEvent::JobProgress { .. }));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn preserves_per_subscriber_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe([Topic::Queue]);

        for i in 0..5 {
            bus.publish(&progress_event(f64::from(i) / 10.0));
        }

        let mut last = -1.0;
        for _ in 0..5 {
            match sub.recv().await.unwrap() {
                AppEvent::JobProgress { progress, .. } => {
                    assert!(progress > last);
                    last = progress;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn overflow_drops_and_counts_without_blocking() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_with_capacity([Topic::Queue], 2);

        for i in 0..5 {
            bus.publish(&progress_event(f64::from(i) / 10.0));
        }

        assert_eq!(sub.dropped_count(), 3);
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_some());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe([Topic::Queue]);

        bus.unsubscribe(sub.id());
        bus.publish(&progress_event(0.5));

        assert!(sub.try_recv().is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe([Topic::Queue]);
        drop(sub);

        bus.publish(&progress_event(0.5));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn set_topics_changes_routing() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe([Topic::Queue]);

        bus.set_topics(sub.id(), [Topic::Models]);
        bus.publish(&progress_event(0.5));
        bus.publish(&model_event());

        let event = sub.recv().await.unwrap();
        assert!(matches!(event, AppEvent::ModelStateChanged { .. }));
    }
}
