//! Real-time event fan-out to WebSocket clients.
//!
//! The hub keeps one bus subscription whose topic filter is the union of
//! every live connection's topics, and a bounded send buffer per
//! connection. A client that cannot drain its buffer is disconnected with
//! a policy-violation close — dropped events are counted, never replayed;
//! clients resync over REST.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};

use px_core::bus::{topic_matches, EventBus, Subscription};

use crate::protocol::ServerFrame;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Outbound frames buffered per connection before it is dropped.
    pub buffer: usize,
    /// Server-initiated ping cadence.
    pub ping_interval: Duration,
    /// Close the connection when the client stays silent this long.
    pub idle_timeout: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            buffer: 256,
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

// Filter that matches nothing; used while no client has subscribed.
const NO_TOPICS: &str = "__no_subscriptions__";

struct ConnHandle {
    tx: flume::Sender<ServerFrame>,
    /// Copy-on-write topic set: swapped wholesale on subscribe changes so
    /// the fan-out path only clones an `Arc` under the read lock.
    topics: RwLock<Arc<HashSet<String>>>,
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

pub struct Hub {
    conns: DashMap<u64, ConnHandle>,
    bus_sub: Subscription,
    next_id: AtomicU64,
    dropped: AtomicU64,
    settings: HubSettings,
}

impl Hub {
    /// Create the hub and spawn its bus-forwarding task.
    pub fn spawn(bus: &EventBus, settings: HubSettings) -> Arc<Self> {
        let hub = Arc::new(Self {
            conns: DashMap::new(),
            bus_sub: bus.subscribe(&[NO_TOPICS]),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            settings,
        });
        let forwarder = hub.clone();
        tokio::spawn(async move { forwarder.run().await });
        hub
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Register a connection; returns its id and the receiving end the
    /// socket writer drains. The hub holds the only sender, so evicting
    /// the connection closes the channel once buffered frames drain.
    pub fn register(&self) -> (u64, flume::Receiver<ServerFrame>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = flume::bounded(self.settings.buffer);
        self.conns.insert(
            id,
            ConnHandle {
                tx,
                topics: RwLock::new(Arc::new(HashSet::new())),
            },
        );
        debug!(conn_id = id, "websocket connection registered");
        (id, rx)
    }

    /// Queue a direct frame (pong, protocol error) onto one connection's
    /// buffer. Returns `false` when the connection is gone or overflowed.
    pub fn send_to(&self, conn_id: u64, frame: ServerFrame) -> bool {
        match self.conns.get(&conn_id) {
            Some(conn) => match conn.tx.try_send(frame) {
                Ok(()) => true,
                Err(flume::TrySendError::Full(_)) => {
                    drop(conn);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    self.unregister(conn_id);
                    false
                }
                Err(flume::TrySendError::Disconnected(_)) => false,
            },
            None => false,
        }
    }

    /// Drop a connection. Idempotent.
    pub fn unregister(&self, conn_id: u64) {
        if self.conns.remove(&conn_id).is_some() {
            debug!(conn_id, "websocket connection unregistered");
            self.refresh_union();
        }
    }

    pub fn subscribe_topics(&self, conn_id: u64, topics: &[String]) {
        if let Some(conn) = self.conns.get(&conn_id) {
            let mut updated: HashSet<String> = (**conn.topics.read().expect("topics lock")).clone();
            updated.extend(topics.iter().cloned());
            *conn.topics.write().expect("topics lock") = Arc::new(updated);
        }
        self.refresh_union();
    }

    pub fn unsubscribe_topics(&self, conn_id: u64, topics: &[String]) {
        if let Some(conn) = self.conns.get(&conn_id) {
            let mut updated: HashSet<String> = (**conn.topics.read().expect("topics lock")).clone();
            for topic in topics {
                updated.remove(topic);
            }
            *conn.topics.write().expect("topics lock") = Arc::new(updated);
        }
        self.refresh_union();
    }

    /// Point the bus subscription at the union of live topics.
    fn refresh_union(&self) {
        let mut union: HashSet<String> = HashSet::new();
        for conn in self.conns.iter() {
            union.extend(conn.topics.read().expect("topics lock").iter().cloned());
        }
        if union.is_empty() {
            self.bus_sub.set_topics(&[NO_TOPICS]);
        } else {
            let topics: Vec<&str> = union.iter().map(String::as_str).collect();
            self.bus_sub.set_topics(&topics);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Events dropped because a slow client overflowed its buffer.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn run(self: Arc<Self>) {
        while let Some(event) = self.bus_sub.recv().await {
            let frame = ServerFrame::event(event.clone());
            let mut evict = Vec::new();
            for conn in self.conns.iter() {
                let topics = conn.topics.read().expect("topics lock").clone();
                let interested = topics.iter().any(|f| topic_matches(f, &event.kind));
                if !interested {
                    continue;
                }
                match conn.tx.try_send(frame.clone()) {
                    Ok(()) => {}
                    Err(flume::TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        evict.push(*conn.key());
                    }
                    Err(flume::TrySendError::Disconnected(_)) => {
                        evict.push(*conn.key());
                    }
                }
            }
            let mut evicted_any = false;
            for conn_id in evict {
                // Removing the handle drops our sender; the connection's
                // writer drains what it can and closes with 1008.
                if self.conns.remove(&conn_id).is_some() {
                    info!(conn_id, "websocket client evicted (buffer overflow)");
                    evicted_any = true;
                }
            }
            if evicted_any {
                self.refresh_union();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
