use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known event kinds published on the bus.
pub mod topics {
    pub const EXPERIMENT_CREATED: &str = "experiment.created";
    pub const EXPERIMENT_UPDATED: &str = "experiment.updated";
    pub const EXPERIMENT_STARTED: &str = "experiment.started";
    pub const EXPERIMENT_COMPLETED: &str = "experiment.completed";
    pub const EXPERIMENT_FAILED: &str = "experiment.failed";
    pub const EXPERIMENT_CANCELLED: &str = "experiment.cancelled";
    pub const DEPLOYMENT_CREATED: &str = "deployment.created";
    pub const DEPLOYMENT_UPDATED: &str = "deployment.updated";
    pub const DEPLOYMENT_ROLLED_BACK: &str = "deployment.rolled_back";
    pub const DEPLOYMENT_DELETED: &str = "deployment.deleted";
    pub const TASK_CREATED: &str = "task.created";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const METRICS_UPDATE: &str = "metrics.update";
    pub const AGENT_ONLINE: &str = "agent.online";
    pub const AGENT_OFFLINE: &str = "agent.offline";
}

/// A single event published on the in-process bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Returns `true` when `filter` matches event kind `kind`.
///
/// A filter is either an exact kind, `*` (everything), or a wildcard of the
/// form `prefix.*`, which matches `prefix.<anything>` but not `prefix`
/// itself and not other kinds that merely share leading characters.
pub fn topic_matches(filter: &str, kind: &str) -> bool {
    if filter == "*" {
        return true;
    }
    if let Some(prefix) = filter.strip_suffix(".*") {
        return kind
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'));
    }
    filter == kind
}

const DEFAULT_CAPACITY: usize = 256;

// Publisher-side view of one subscription. `topics` is swapped wholesale on
// change so `publish` only ever takes a read lock on a cheap Arc clone.
struct SubscriberSlot {
    tx: flume::Sender<Event>,
    topics: Arc<RwLock<Arc<Vec<String>>>>,
    dropped: Arc<AtomicU64>,
}

/// In-process publish/subscribe with topic filtering.
///
/// Fan-out is best-effort and never blocks the publisher: each subscriber
/// has a bounded channel, and a full channel drops the event for that
/// subscriber while incrementing its `dropped` counter. The bus is cheap to
/// clone (it wraps its internals in an `Arc`).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<SubscriberSlot>>>,
}

impl EventBus {
    /// Create a new, empty event bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a subscriber interested in `topics` (empty = everything)
    /// with the default buffer capacity.
    pub fn subscribe(&self, topics: &[&str]) -> Subscription {
        self.subscribe_with_capacity(topics, DEFAULT_CAPACITY)
    }

    /// Register a subscriber with an explicit buffer capacity.
    pub fn subscribe_with_capacity(&self, topics: &[&str], capacity: usize) -> Subscription {
        let (tx, rx) = flume::bounded(capacity);
        let topics: Arc<RwLock<Arc<Vec<String>>>> = Arc::new(RwLock::new(Arc::new(
            topics.iter().map(|s| s.to_string()).collect(),
        )));
        let dropped = Arc::new(AtomicU64::new(0));
        let mut slots = self.inner.lock().expect("EventBus lock poisoned");
        slots.push(SubscriberSlot {
            tx,
            topics: topics.clone(),
            dropped: dropped.clone(),
        });
        Subscription {
            rx,
            topics,
            dropped,
        }
    }

    /// Publish an event to every subscriber whose filter matches.
    ///
    /// Disconnected subscribers (whose receivers have been dropped) are
    /// pruned. Never blocks: a slow subscriber loses the event instead.
    pub fn publish(&self, event: Event) {
        let mut slots = self.inner.lock().expect("EventBus lock poisoned");
        slots.retain(|slot| {
            if slot.tx.is_disconnected() {
                return false;
            }
            let topics = slot
                .topics
                .read()
                .expect("subscription topics lock poisoned")
                .clone();
            let interested =
                topics.is_empty() || topics.iter().any(|f| topic_matches(f, &event.kind));
            if !interested {
                return true;
            }
            match slot.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(flume::TrySendError::Full(_)) => {
                    slot.dropped.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(flume::TrySendError::Disconnected(_)) => false,
            }
        });
    }

    /// Return the number of currently active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("EventBus lock poisoned").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// The receiving end of a bus subscription. Dropping it tears the
/// subscription down; the publisher prunes the slot on its next publish.
pub struct Subscription {
    rx: flume::Receiver<Event>,
    topics: Arc<RwLock<Arc<Vec<String>>>>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Receive the next matching event, waiting until one arrives or the
    /// bus is dropped.
    pub async fn recv(&self) -> Option<Event> {
        self.rx.recv_async().await.ok()
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Replace the topic filter. The new set applies to events published
    /// after the swap; in-flight buffered events are unaffected.
    pub fn set_topics(&self, topics: &[&str]) {
        let new: Arc<Vec<String>> = Arc::new(topics.iter().map(|s| s.to_string()).collect());
        *self
            .topics
            .write()
            .expect("subscription topics lock poisoned") = new;
    }

    /// Events dropped for this subscriber because its buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of buffered events not yet received.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_wildcard_matching() {
        assert!(topic_matches("experiment.created", "experiment.created"));
        assert!(topic_matches("experiment.*", "experiment.created"));
        assert!(topic_matches("experiment.*", "experiment.phase.changed"));
        assert!(!topic_matches("experiment.*", "experiment"));
        assert!(!topic_matches("experiment.*", "experiments.created"));
        assert!(!topic_matches("experiment.*", "metrics.update"));
        assert!(topic_matches("*", "anything.at.all"));
    }

    #[tokio::test]
    async fn filtered_delivery() {
        let bus = EventBus::new();
        let exp = bus.subscribe(&["experiment.*"]);
        let metrics = bus.subscribe(&["metrics.update"]);

        bus.publish(Event::new(
            topics::EXPERIMENT_CREATED,
            serde_json::json!({"id": "exp-1"}),
        ));
        bus.publish(Event::new(
            topics::METRICS_UPDATE,
            serde_json::json!({"id": "exp-1"}),
        ));

        assert_eq!(exp.recv().await.unwrap().kind, "experiment.created");
        assert!(exp.try_recv().is_none());
        assert_eq!(metrics.recv().await.unwrap().kind, "metrics.update");
        assert!(metrics.try_recv().is_none());
    }

    #[test]
    fn full_buffer_drops_and_counts() {
        let bus = EventBus::new();
        let sub = bus.subscribe_with_capacity(&[], 2);
        for _ in 0..5 {
            bus.publish(Event::new("x", serde_json::Value::Null));
        }
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.dropped(), 3);
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe(&[]);
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        bus.publish(Event::new("x", serde_json::Value::Null));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn set_topics_swaps_filter() {
        let bus = EventBus::new();
        let sub = bus.subscribe(&["experiment.*"]);
        sub.set_topics(&["task.failed"]);
        bus.publish(Event::new("experiment.created", serde_json::Value::Null));
        bus.publish(Event::new("task.failed", serde_json::Value::Null));
        assert_eq!(sub.recv().await.unwrap().kind, "task.failed");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn publish_order_preserved_per_subscriber() {
        let bus = EventBus::new();
        let sub = bus.subscribe(&[]);
        for i in 0..10 {
            bus.publish(Event::new(format!("e.{i}"), serde_json::Value::Null));
        }
        for i in 0..10 {
            assert_eq!(sub.recv().await.unwrap().kind, format!("e.{i}"));
        }
    }
}
