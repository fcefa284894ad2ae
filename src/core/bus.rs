//! In-process publish/subscribe control plane
//!
//! Each subscriber owns a bounded FIFO. Publication order is preserved per
//! topic per subscriber. On overflow the publisher blocks up to a deadline,
//! then drops the oldest entry of the slowest subscriber (counted); a full
//! queue on one subscriber never loses messages for the others.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

struct SubscriberQueue {
    items: Mutex<VecDeque<Value>>,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
    notify_items: Notify,
    notify_space: Notify,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        SubscriberQueue {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            notify_items: Notify::new(),
            notify_space: Notify::new(),
        }
    }

    /// Returns true when the oldest entry had to be dropped to make room.
    async fn push(&self, value: Value, deadline: Duration) -> bool {
        let deadline_at = tokio::time::Instant::now() + deadline;
        loop {
            {
                let mut items = self.items.lock();
                if items.len() < self.capacity {
                    items.push_back(value);
                    drop(items);
                    self.notify_items.notify_one();
                    return false;
                }
            }
            let remaining = deadline_at.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                let mut items = self.items.lock();
                if items.len() >= self.capacity {
                    items.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                items.push_back(value);
                drop(items);
                self.notify_items.notify_one();
                return true;
            }
            let _ = tokio::time::timeout(remaining, self.notify_space.notified()).await;
        }
    }
}

/// Receiving half handed to a subscriber. Yields payloads in publication
/// order until the topic is closed and the backlog drained.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    pub async fn recv(&self) -> Option<Value> {
        loop {
            {
                let mut items = self.queue.items.lock();
                if let Some(value) = items.pop_front() {
                    drop(items);
                    self.queue.notify_space.notify_one();
                    return Some(value);
                }
                if self.queue.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.queue.notify_items.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<Value> {
        let mut items = self.queue.items.lock();
        let value = items.pop_front();
        if value.is_some() {
            self.queue.notify_space.notify_one();
        }
        value
    }

    pub fn len(&self) -> usize {
        self.queue.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct TopicState {
    subscribers: Vec<Arc<SubscriberQueue>>,
    closed: bool,
}

/// Single-process message bus with per-subscriber bounded queues.
pub struct MessageBus {
    topics: RwLock<HashMap<String, TopicState>>,
    capacity: usize,
    publish_deadline: Duration,
}

impl MessageBus {
    pub fn new(capacity: usize, publish_deadline_ms: u64) -> Self {
        MessageBus {
            topics: RwLock::new(HashMap::new()),
            capacity,
            publish_deadline: Duration::from_millis(publish_deadline_ms),
        }
    }

    /// Fire-and-forget publish. Blocks only when a subscriber queue is full,
    /// and never past the configured deadline.
    pub async fn publish(&self, topic: &str, payload: Value) {
        let subscribers: Vec<Arc<SubscriberQueue>> = {
            let topics = self.topics.read();
            match topics.get(topic) {
                Some(state) if !state.closed => state.subscribers.clone(),
                _ => {
                    debug!("[Bus] publish on '{}' with no live subscribers", topic);
                    return;
                }
            }
        };

        for queue in subscribers {
            if queue.closed.load(Ordering::Acquire) {
                continue;
            }
            if queue.push(payload.clone(), self.publish_deadline).await {
                warn!(
                    "[Bus] 🐌 slow subscriber on '{}': dropped oldest entry (total {})",
                    topic,
                    queue.dropped.load(Ordering::Relaxed)
                );
            }
        }
    }

    /// Register a new subscriber on a topic; each subscriber gets its own FIFO.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let queue = Arc::new(SubscriberQueue::new(self.capacity));
        let mut topics = self.topics.write();
        let state = topics.entry(topic.to_string()).or_insert_with(|| TopicState {
            subscribers: Vec::new(),
            closed: false,
        });
        state.subscribers.push(queue.clone());
        Subscription { queue }
    }

    /// Close a topic: remaining items stay queued for every live subscriber
    /// and `recv` returns `None` once each backlog is drained.
    pub fn close(&self, topic: &str) {
        let mut topics = self.topics.write();
        if let Some(state) = topics.get_mut(topic) {
            state.closed = true;
            for queue in &state.subscribers {
                queue.closed.store(true, Ordering::Release);
                queue.notify_items.notify_waiters();
            }
        }
    }

    /// Total messages dropped across all subscribers of a topic.
    pub fn dropped_count(&self, topic: &str) -> u64 {
        let topics = self.topics.read();
        topics
            .get(topic)
            .map(|state| {
                state
                    .subscribers
                    .iter()
                    .map(|q| q.dropped.load(Ordering::Relaxed))
                    .sum()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn per_subscriber_ordering() {
        let bus = MessageBus::new(16, 50);
        let sub = bus.subscribe("t");
        for i in 0..5 {
            bus.publish("t", json!(i)).await;
        }
        for i in 0..5 {
            assert_eq!(sub.recv().await.unwrap(), json!(i));
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_for_slowest_only() {
        let bus = MessageBus::new(2, 10);
        let slow = bus.subscribe("t");
        let fast = bus.subscribe("t");

        // drain fast concurrently, leave slow alone
        bus.publish("t", json!(0)).await;
        bus.publish("t", json!(1)).await;
        assert_eq!(fast.recv().await.unwrap(), json!(0));
        assert_eq!(fast.recv().await.unwrap(), json!(1));

        // third publish overflows the untouched slow queue after the deadline
        bus.publish("t", json!(2)).await;
        assert_eq!(bus.dropped_count("t"), 1);
        assert_eq!(slow.recv().await.unwrap(), json!(1));
        assert_eq!(slow.recv().await.unwrap(), json!(2));
        assert_eq!(fast.recv().await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn close_flushes_then_signals_end() {
        let bus = MessageBus::new(8, 50);
        let sub = bus.subscribe("t");
        bus.publish("t", json!("a")).await;
        bus.publish("t", json!("b")).await;
        bus.close("t");
        assert_eq!(sub.recv().await.unwrap(), json!("a"));
        assert_eq!(sub.recv().await.unwrap(), json!("b"));
        assert!(sub.recv().await.is_none());
    }
}
