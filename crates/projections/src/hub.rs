//! Live update fan-out for order watchers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use common::OrderId;
use events::OrderStatus;

/// One status update pushed to subscribers of an order.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub order_id: OrderId,
    pub event_type: String,
    pub status: OrderStatus,
    pub at: DateTime<Utc>,
    pub details: serde_json::Value,
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    subscribers: HashMap<OrderId, HashMap<u64, mpsc::UnboundedSender<OrderUpdate>>>,
}

/// Routes projected updates to whoever is watching a given order.
///
/// Subscribers that fall away (dropped streams, closed connections) are
/// pruned on the next publish to their order.
#[derive(Clone, Default)]
pub struct SubscriptionHub {
    state: Arc<Mutex<HubState>>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a watcher for one order's updates.
    pub fn subscribe(&self, order_id: OrderId) -> UpdateStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.subscribers.entry(order_id).or_default().insert(id, tx);
        UpdateStream {
            hub: self.state.clone(),
            order_id,
            id,
            rx,
        }
    }

    /// Delivers an update to every live watcher of its order.
    pub fn publish(&self, update: OrderUpdate) {
        let mut state = self.state.lock().unwrap();
        if let Some(watchers) = state.subscribers.get_mut(&update.order_id) {
            watchers.retain(|_, tx| tx.send(update.clone()).is_ok());
            if watchers.is_empty() {
                state.subscribers.remove(&update.order_id);
            }
        }
    }

    pub fn watcher_count(&self, order_id: OrderId) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscribers
            .get(&order_id)
            .map(|w| w.len())
            .unwrap_or(0)
    }
}

/// A subscriber's receiving end; deregisters itself on drop.
pub struct UpdateStream {
    hub: Arc<Mutex<HubState>>,
    order_id: OrderId,
    id: u64,
    rx: mpsc::UnboundedReceiver<OrderUpdate>,
}

impl UpdateStream {
    pub async fn recv(&mut self) -> Option<OrderUpdate> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OrderUpdate> {
        self.rx.try_recv().ok()
    }
}

impl Drop for UpdateStream {
    fn drop(&mut self) {
        let mut state = self.hub.lock().unwrap();
        if let Some(watchers) = state.subscribers.get_mut(&self.order_id) {
            watchers.remove(&self.id);
            if watchers.is_empty() {
                state.subscribers.remove(&self.order_id);
            }
        }
    }
}
