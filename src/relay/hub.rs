use std::{
    collections::HashSet,
    sync::{Mutex, Weak},
};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::relay::{collaborators::Broadcaster, id::new_subscriber_id};

/// Inbox capacity per subscriber. The spec requires at least 256; one slot of
/// headroom keeps a `try_send` on a freshly-created, still-empty inbox from
/// racing a `SlowSubscriber` eviction under ordinary load.
const INBOX_CAPACITY: usize = 257;

/// One message pushed to subscribers whose filter matches.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub relay_id: String,
    pub payload: Value,
}

/// `topics ∈ sub.topics ∧ (sub.relay_id = "" ∨ sub.relay_id = msg.relay_id)`.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub topics: HashSet<String>,
    pub relay_id: String,
}

impl Filter {
    fn matches(&self, msg: &Message) -> bool {
        self.topics.contains(&msg.topic)
            && (self.relay_id.is_empty() || self.relay_id == msg.relay_id)
    }
}

struct Subscriber {
    tx: mpsc::Sender<Message>,
    filter: Mutex<Filter>,
}

/// Concurrent fan-out hub: many subscribers, each with its own topic/rule
/// filter and bounded inbox. Registration goes through `DashMap`'s sharded
/// locks, so `publish` only ever takes a per-shard read lock and never blocks
/// on a subscriber's own state — the write path for a single slow consumer
/// cannot stall delivery to the rest.
#[derive(Default)]
pub struct Hub {
    subscribers: DashMap<u64, Subscriber>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber and returns its receiving half plus a
    /// handle that unsubscribes on drop.
    pub fn subscribe(self: &std::sync::Arc<Self>, filter: Filter) -> (SubscriberHandle, mpsc::Receiver<Message>) {
        let id = new_subscriber_id();
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.subscribers.insert(
            id,
            Subscriber {
                tx,
                filter: Mutex::new(filter),
            },
        );
        let handle = SubscriberHandle {
            id,
            hub: std::sync::Arc::downgrade(self),
        };
        (handle, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }

    /// Replaces a subscriber's filter. A no-op if the subscriber has already
    /// been evicted or disconnected.
    pub fn update_filter(&self, id: u64, filter: Filter) {
        if let Some(entry) = self.subscribers.get(&id) {
            *entry.filter.lock().unwrap() = filter;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Broadcaster for Hub {
    fn broadcast_to_relay(&self, relay_id: &str, topic: &str, payload: Value) {
        let msg = Message {
            topic: topic.to_string(),
            relay_id: relay_id.to_string(),
            payload,
        };

        let mut slow = Vec::new();
        for entry in self.subscribers.iter() {
            let matches = entry.filter.lock().unwrap().matches(&msg);
            if !matches {
                continue;
            }
            if entry.tx.try_send(msg.clone()).is_err() {
                slow.push(*entry.key());
            }
        }

        for id in slow {
            warn!(subscriber_id = id, "evicting slow telemetry subscriber");
            self.subscribers.remove(&id);
        }
    }
}

/// Handle returned from `Hub::subscribe`. Dropping it unsubscribes, closing
/// the subscriber's inbox so its reader task observes channel closure and
/// exits on its own.
pub struct SubscriberHandle {
    id: u64,
    hub: Weak<Hub>,
}

impl SubscriberHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn update_filter(&self, filter: Filter) {
        if let Some(hub) = self.hub.upgrade() {
            hub.update_filter(self.id, filter);
        }
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn filter(topics: &[&str], relay_id: &str) -> Filter {
        Filter {
            topics: topics.iter().map(|s| s.to_string()).collect(),
            relay_id: relay_id.to_string(),
        }
    }

    #[tokio::test]
    async fn delivers_only_to_matching_topic_and_relay() {
        let hub = Arc::new(Hub::new());
        let (_h1, mut rx1) = hub.subscribe(filter(&["relay.traffic"], "rule-a"));
        let (_h2, mut rx2) = hub.subscribe(filter(&["relay.connections"], ""));

        hub.broadcast_to_relay("rule-a", "relay.traffic", serde_json::json!({"x": 1}));
        hub.broadcast_to_relay("rule-b", "relay.traffic", serde_json::json!({"x": 2}));

        let got = rx1.try_recv().expect("sub1 should have received rule-a traffic");
        assert_eq!(got.relay_id, "rule-a");
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_on_drop_closes_inbox() {
        let hub = Arc::new(Hub::new());
        let (handle, mut rx) = hub.subscribe(filter(&["relay.traffic"], ""));
        assert_eq!(hub.subscriber_count(), 1);
        drop(handle);
        assert_eq!(hub.subscriber_count(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted_without_blocking_publisher() {
        let hub = Arc::new(Hub::new());
        let (_handle, mut rx) = hub.subscribe(filter(&["t"], ""));

        for i in 0..(INBOX_CAPACITY + 5) {
            hub.broadcast_to_relay("r", "t", serde_json::json!({"i": i}));
        }

        assert_eq!(hub.subscriber_count(), 0);
        // The reader can still drain whatever made it into the inbox before eviction.
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert!(drained <= INBOX_CAPACITY);
    }

    /// S6: a subscriber that never drains its inbox gets evicted once it
    /// overflows, but a sibling subscriber that keeps up receives every
    /// sample, in order, unaffected by the eviction.
    #[tokio::test]
    async fn slow_sibling_eviction_does_not_affect_healthy_subscriber() {
        let hub = Arc::new(Hub::new());
        let (_slow_handle, _slow_rx) = hub.subscribe(filter(&["t"], ""));
        let (healthy_handle, mut healthy_rx) = hub.subscribe(filter(&["t"], ""));

        // Drain the healthy subscriber concurrently so it never overflows,
        // unlike its never-drained sibling.
        let drainer = tokio::spawn(async move {
            let mut received = Vec::new();
            while let Some(msg) = healthy_rx.recv().await {
                received.push(msg);
            }
            received
        });

        let total = INBOX_CAPACITY + 5;
        for i in 0..total {
            hub.broadcast_to_relay("r", "t", serde_json::json!({"i": i}));
            tokio::task::yield_now().await;
        }

        assert_eq!(hub.subscriber_count(), 1);

        drop(healthy_handle);
        let received = drainer.await.unwrap();
        assert_eq!(received.len(), total);
        for (expected, msg) in received.iter().enumerate() {
            assert_eq!(msg.payload["i"], expected);
        }
    }
}
