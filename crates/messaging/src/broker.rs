//! Broker abstraction and in-memory implementation.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::sync::mpsc;

use crate::error::{MessagingError, Result};

/// A message as it arrives from the broker: raw bytes plus routing
/// metadata. The value is deliberately untyped so that a malformed
/// message can still be received and dead-lettered.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub key: String,
    pub value: Vec<u8>,
}

/// The publish/subscribe seam between services and the transport.
///
/// Delivery is at-least-once; consumers are expected to deduplicate via
/// the idempotency guard. Messages sharing a key arrive in publish order.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publishes a message to a topic.
    async fn publish(&self, topic: &str, key: &str, value: Vec<u8>) -> Result<()>;

    /// Subscribes a consumer group to a set of topics, replaying retained
    /// messages from the beginning before live delivery.
    async fn subscribe(&self, group: &str, topics: &[&str]) -> Result<Subscription>;
}

/// A single consumer's ordered message feed.
///
/// One subscription is one FIFO channel, so messages for any given key are
/// handled strictly in arrival order within a consumer instance.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    /// Waits for the next message; returns `None` when the broker is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Returns the next message if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

struct SubscriberEntry {
    group: String,
    topics: HashSet<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BrokerState {
    log: Vec<Delivery>,
    subscribers: Vec<SubscriberEntry>,
    fail_publishes: bool,
}

/// In-memory broker for tests and single-process wiring.
///
/// Retains every published message and replays from the beginning on
/// subscribe, mirroring a durable log consumed with an earliest-offset
/// policy.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<RwLock<BrokerState>>,
}

impl InMemoryBroker {
    /// Creates a new empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent publish fail until switched off, simulating
    /// an unreachable broker.
    pub async fn set_fail_publishes(&self, fail: bool) {
        self.state.write().await.fail_publishes = fail;
    }

    /// Total number of retained messages.
    pub async fn published_count(&self) -> usize {
        self.state.read().await.log.len()
    }

    /// All retained messages on one topic, in publish order.
    pub async fn messages_on(&self, topic: &str) -> Vec<Delivery> {
        self.state
            .read()
            .await
            .log
            .iter()
            .filter(|d| d.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, key: &str, value: Vec<u8>) -> Result<()> {
        let mut state = self.state.write().await;
        if state.fail_publishes {
            return Err(MessagingError::Broker("broker unreachable".to_string()));
        }

        let delivery = Delivery {
            topic: topic.to_string(),
            key: key.to_string(),
            value,
        };
        state.log.push(delivery.clone());

        // Fan out to live subscriptions, dropping the ones whose receiver
        // side has gone away.
        state.subscribers.retain(|sub| {
            if !sub.topics.contains(topic) {
                return true;
            }
            match sub.tx.send(delivery.clone()) {
                Ok(()) => true,
                Err(_) => {
                    tracing::debug!(group = %sub.group, topic, "dropping closed subscription");
                    false
                }
            }
        });

        Ok(())
    }

    async fn subscribe(&self, group: &str, topics: &[&str]) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let topics: HashSet<String> = topics.iter().map(|t| t.to_string()).collect();

        let mut state = self.state.write().await;
        for delivery in state.log.iter().filter(|d| topics.contains(&d.topic)) {
            // Receiver is still in scope, the send cannot fail here.
            let _ = tx.send(delivery.clone());
        }
        state.subscribers.push(SubscriberEntry {
            group: group.to_string(),
            topics,
            tx,
        });

        Ok(Subscription { rx })
    }
}
