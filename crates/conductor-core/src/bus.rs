//! In-process event fan-out with bounded replay.
//!
//! Topics are created lazily on first publish or subscribe. Each topic keeps
//! a bounded ring of recent events for replay plus a broadcast channel for
//! live delivery. Publishing never blocks: a subscriber that falls behind
//! loses its oldest pending events and receives a `dropped=N` marker frame
//! instead, without affecting other subscribers.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::broadcast;

/// Ring size for per-worker log topics.
pub const LOG_RING: usize = 300;
/// Ring size for the system (dispatcher event) topic.
pub const SYSTEM_RING: usize = 1000;

/// The dispatcher event topic.
pub const TOPIC_SYSTEM: &str = "system";

/// Topic carrying agent output for one worker.
pub fn topic_log(worker_id: &str) -> String {
    format!("log:{worker_id}")
}

/// Topic carrying the plan conversation for one task.
pub fn topic_plan(project_id: &str, task_id: &str) -> String {
    format!("plan:{project_id}:{task_id}")
}

struct Topic {
    tx: broadcast::Sender<Value>,
    ring: VecDeque<Value>,
    capacity: usize,
}

impl Topic {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            ring: VecDeque::with_capacity(capacity),
            capacity,
        }
    }
}

/// Bounded-fan-out event bus shared by the scheduler and the gateway.
pub struct EventBus {
    topics: Mutex<HashMap<String, Topic>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn ring_capacity(topic: &str) -> usize {
        if topic == TOPIC_SYSTEM {
            SYSTEM_RING
        } else {
            LOG_RING
        }
    }

    /// Publish an event. Never blocks; events published with no live
    /// subscriber are still recorded in the replay ring.
    pub fn publish(&self, topic: &str, event: Value) {
        let mut topics = self.topics.lock().expect("event bus lock poisoned");
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(Self::ring_capacity(topic)));
        if entry.ring.len() == entry.capacity {
            entry.ring.pop_front();
        }
        entry.ring.push_back(event.clone());
        // Send errors only mean there is no subscriber right now.
        let _ = entry.tx.send(event);
    }

    /// Subscribe to a topic, receiving the last `replay_n` events immediately
    /// and live events afterwards.
    pub fn subscribe(&self, topic: &str, replay_n: usize) -> Subscription {
        let mut topics = self.topics.lock().expect("event bus lock poisoned");
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(Self::ring_capacity(topic)));
        let replay: VecDeque<Value> = entry
            .ring
            .iter()
            .rev()
            .take(replay_n)
            .rev()
            .cloned()
            .collect();
        Subscription {
            replay,
            rx: entry.tx.subscribe(),
        }
    }

    /// Return the last `last_n` events of a topic without subscribing.
    pub fn replay(&self, topic: &str, last_n: usize) -> Vec<Value> {
        let topics = self.topics.lock().expect("event bus lock poisoned");
        match topics.get(topic) {
            Some(entry) => entry
                .ring
                .iter()
                .rev()
                .take(last_n)
                .rev()
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's view of a topic: replayed history, then live events.
pub struct Subscription {
    replay: VecDeque<Value>,
    rx: broadcast::Receiver<Value>,
}

impl Subscription {
    /// Receive the next event.
    ///
    /// Replayed events are drained first. When the subscriber lagged behind
    /// the channel, a `{"type":"dropped","count":N}` marker is returned in
    /// place of the lost events. Returns `None` once the topic is gone and
    /// all events are consumed.
    pub async fn recv(&mut self) -> Option<Value> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                Some(serde_json::json!({ "type": "dropped", "count": n }))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-blocking variant used by tests and draining loops.
    pub fn try_recv(&mut self) -> Option<Value> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Some(serde_json::json!({ "type": "dropped", "count": n }))
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replay_returns_most_recent_in_order() {
        let bus = EventBus::new();
        for i in 0..5 {
            bus.publish("log:worker-0", json!({ "seq": i }));
        }
        let replay = bus.replay("log:worker-0", 3);
        assert_eq!(replay.len(), 3);
        assert_eq!(replay[0]["seq"], 2);
        assert_eq!(replay[2]["seq"], 4);
    }

    #[test]
    fn ring_is_bounded() {
        let bus = EventBus::new();
        for i in 0..(LOG_RING + 50) {
            bus.publish("log:worker-1", json!({ "seq": i }));
        }
        let replay = bus.replay("log:worker-1", LOG_RING + 50);
        assert_eq!(replay.len(), LOG_RING);
        assert_eq!(replay[0]["seq"], 50);
    }

    #[test]
    fn system_topic_has_larger_ring() {
        let bus = EventBus::new();
        for i in 0..(SYSTEM_RING + 10) {
            bus.publish(TOPIC_SYSTEM, json!({ "seq": i }));
        }
        assert_eq!(bus.replay(TOPIC_SYSTEM, usize::MAX).len(), SYSTEM_RING);
    }

    #[tokio::test]
    async fn subscriber_gets_replay_then_live() {
        let bus = EventBus::new();
        bus.publish("log:worker-0", json!({ "seq": 0 }));
        bus.publish("log:worker-0", json!({ "seq": 1 }));

        let mut sub = bus.subscribe("log:worker-0", 1);
        bus.publish("log:worker-0", json!({ "seq": 2 }));

        assert_eq!(sub.recv().await.unwrap()["seq"], 1);
        assert_eq!(sub.recv().await.unwrap()["seq"], 2);
    }

    #[tokio::test]
    async fn lagged_subscriber_sees_dropped_marker() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("log:worker-0", 0);
        // Overflow the broadcast channel capacity for this subscriber.
        for i in 0..(LOG_RING * 2) {
            bus.publish("log:worker-0", json!({ "seq": i }));
        }
        let first = sub.recv().await.unwrap();
        assert_eq!(first["type"], "dropped");
        assert!(first["count"].as_u64().unwrap() > 0);
        // Subsequent events flow normally.
        let next = sub.recv().await.unwrap();
        assert!(next.get("seq").is_some());
    }

    #[tokio::test]
    async fn publish_does_not_block_on_slow_subscriber() {
        let bus = EventBus::new();
        let _sub = bus.subscribe("log:worker-0", 0);
        // A full channel must not stall the producer.
        for i in 0..(LOG_RING * 3) {
            bus.publish("log:worker-0", json!({ "seq": i }));
        }
    }

    #[test]
    fn topics_are_isolated() {
        let bus = EventBus::new();
        bus.publish(&topic_log("worker-0"), json!({ "w": 0 }));
        bus.publish(&topic_log("worker-1"), json!({ "w": 1 }));
        assert_eq!(bus.replay("log:worker-0", 10).len(), 1);
        assert_eq!(bus.replay("log:worker-1", 10).len(), 1);
        assert!(bus.replay("log:worker-2", 10).is_empty());
    }

    #[test]
    fn topic_names() {
        assert_eq!(topic_log("worker-3"), "log:worker-3");
        assert_eq!(topic_plan("ab12cd34", "t-000007"), "plan:ab12cd34:t-000007");
    }
}
