//! In-process event bus with bounded per-subscriber queues.
//!
//! Fan-out of domain events to live subscribers (SSE adapters, tests).
//! Publish never blocks: a subscriber whose queue is full loses that event
//! and a warning is logged. Per-subscriber ordering is preserved; global
//! ordering across subscribers is not.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::models::now_ts;

pub const MAX_SUBSCRIBERS: usize = 50;
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 100;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Transaction {
        txn_id: String,
        amount: f64,
        currency: String,
        sender_id: String,
        receiver_id: String,
        txn_type: String,
        risk_score: f64,
        decision: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_fraud_ground_truth: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fraud_type: Option<String>,
        timestamp: String,
    },
    CaseCreated {
        case_id: String,
        txn_id: String,
        risk_score: f64,
        decision: String,
        timestamp: String,
    },
    CaseLabeled {
        case_id: String,
        txn_id: String,
        decision: String,
        new_status: String,
        timestamp: String,
    },
    CaseExplained {
        case_id: String,
        txn_id: String,
        agent: String,
        summary: String,
        recommendation: String,
        timestamp: String,
    },
    Retrain {
        model_version: String,
        metrics: serde_json::Value,
        timestamp: String,
    },
    Pattern {
        name: String,
        pattern_type: String,
        confidence: f64,
        timestamp: String,
    },
    AgentDecision {
        decision_type: String,
        reasoning: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model_version: Option<String>,
        timestamp: String,
    },
    Heartbeat {
        timestamp: String,
    },
    Connected {
        timestamp: String,
    },
}

impl Event {
    pub fn heartbeat() -> Self {
        Event::Heartbeat {
            timestamp: now_ts(),
        }
    }

    pub fn connected() -> Self {
        Event::Connected {
            timestamp: now_ts(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Transaction { .. } => "transaction",
            Event::CaseCreated { .. } => "case_created",
            Event::CaseLabeled { .. } => "case_labeled",
            Event::CaseExplained { .. } => "case_explained",
            Event::Retrain { .. } => "retrain",
            Event::Pattern { .. } => "pattern",
            Event::AgentDecision { .. } => "agent_decision",
            Event::Heartbeat { .. } => "heartbeat",
            Event::Connected { .. } => "connected",
        }
    }
}

struct SubscriberTable {
    next_id: u64,
    senders: HashMap<u64, mpsc::Sender<Event>>,
}

/// Bounded fan-out hub. Cheap to clone; all clones share the table.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<SubscriberTable>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SubscriberTable {
                next_id: 0,
                senders: HashMap::new(),
            })),
        }
    }

    /// Register a new subscriber. Rejected past the hard cap.
    pub fn subscribe(&self) -> Result<Subscription, CoreError> {
        let mut table = self.inner.lock();
        if table.senders.len() >= MAX_SUBSCRIBERS {
            return Err(CoreError::BusFull);
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = table.next_id;
        table.next_id += 1;
        table.senders.insert(id, tx);
        debug!(subscriber = id, total = table.senders.len(), "event bus subscribe");

        Ok(Subscription {
            id,
            rx,
            bus: self.clone(),
        })
    }

    /// Deliver an event to every live subscriber without blocking. Full
    /// queues drop the event for that subscriber; closed queues are removed.
    pub fn publish(&self, event: Event) {
        let mut table = self.inner.lock();
        let mut dead: Vec<u64> = Vec::new();

        for (id, tx) in &table.senders {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        subscriber = id,
                        event = event.type_name(),
                        "subscriber queue full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*id);
                }
            }
        }

        for id in dead {
            table.senders.remove(&id);
        }
    }

    pub fn close(&self, id: u64) {
        self.inner.lock().senders.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().senders.len()
    }
}

/// A live subscription. Dropping it unregisters the subscriber.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    bus: EventBus,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Receive the next event, or a heartbeat after the inactivity window.
    pub async fn recv_or_heartbeat(&mut self) -> Option<Event> {
        match tokio::time::timeout(HEARTBEAT_INTERVAL, self.rx.recv()).await {
            Ok(event) => event,
            Err(_) => Some(Event::heartbeat()),
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.close(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe().unwrap();
        let mut b = bus.subscribe().unwrap();

        bus.publish(Event::connected());

        assert!(matches!(a.recv().await, Some(Event::Connected { .. })));
        assert!(matches!(b.recv().await, Some(Event::Connected { .. })));
    }

    #[tokio::test]
    async fn test_subscriber_cap_enforced() {
        let bus = EventBus::new();
        let mut held = Vec::new();
        for _ in 0..MAX_SUBSCRIBERS {
            held.push(bus.subscribe().unwrap());
        }
        assert!(matches!(bus.subscribe(), Err(CoreError::BusFull)));

        // Dropping one frees a slot.
        held.pop();
        assert!(bus.subscribe().is_ok());
    }

    #[tokio::test]
    async fn test_overflow_drops_without_blocking_publisher() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe().unwrap();

        // Publisher must not block even far past queue capacity.
        for _ in 0..(SUBSCRIBER_QUEUE_CAPACITY * 2) {
            bus.publish(Event::heartbeat());
        }

        // Subscriber still sees exactly a full queue worth of events.
        let mut received = 0;
        while sub.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_removed() {
        let bus = EventBus::new();
        let sub = bus.subscribe().unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_after_inactivity() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe().unwrap();

        let event = sub.recv_or_heartbeat().await.unwrap();
        assert!(matches!(event, Event::Heartbeat { .. }));
    }

    #[test]
    fn test_event_wire_shape_is_tagged() {
        let json = serde_json::to_value(Event::heartbeat()).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert!(json["timestamp"].is_string());
    }
}
