//! The order record owned by the order service, and its storage.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use common::{EventId, OrderId};
use events::{EventEnvelope, OrderItem, OrderStatus};
use messaging::OutboxStore;

use crate::error::{Result, SagaError};

/// One folded progress event in an order's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub event_type: String,
    pub status: OrderStatus,
    pub at: DateTime<Utc>,
}

/// The order service's view of one saga instance.
///
/// Status only ever moves along the legal transition graph; everything
/// that happened to the order is appended to `history`, so a failed and
/// retried step leaves both entries behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAggregate {
    pub id: OrderId,
    pub items: Vec<OrderItem>,
    pub total: i64,
    pub status: OrderStatus,
    pub history: Vec<HistoryEntry>,
    pub correlation_id: EventId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderAggregate {
    /// Creates a fresh order in the `CREATED` state.
    pub fn new(id: OrderId, items: Vec<OrderItem>, total: i64, correlation_id: EventId) -> Self {
        let now = Utc::now();
        Self {
            id,
            items,
            total,
            status: OrderStatus::Created,
            history: vec![HistoryEntry {
                event_type: "order.OrderCreated.v1".to_string(),
                status: OrderStatus::Created,
                at: now,
            }],
            correlation_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether an order may move from one status to another.
    ///
    /// Failure states allow the forward move again (an operator retry
    /// that succeeds), and `PAYMENT_FAILED` additionally allows
    /// `INVENTORY_FAILED` because releasing the reservation is reported
    /// as an inventory failure. `SHIPPED` allows `REFUNDED` so an
    /// operator-issued refund can settle an already shipped order.
    pub fn transition_allowed(from: OrderStatus, to: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (from, to),
            (Created, InventoryReserved)
                | (Created, InventoryFailed)
                | (InventoryReserved, PaymentAuthorized)
                | (InventoryReserved, PaymentFailed)
                | (InventoryFailed, InventoryReserved)
                | (PaymentAuthorized, Shipped)
                | (PaymentAuthorized, ShippingFailed)
                | (PaymentFailed, PaymentAuthorized)
                | (PaymentFailed, InventoryFailed)
                | (ShippingFailed, Shipped)
                | (ShippingFailed, Refunded)
                | (Shipped, Refunded)
        )
    }
}

/// Storage for order records.
///
/// `create` persists the order and stages its `OrderCreated` envelope as
/// one atomic unit, so an order row can never exist without its event
/// being on the way out (nor the other way round).
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn create(
        &self,
        order: &OrderAggregate,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Result<()>;

    /// Folds one progress event into the order's status and history.
    async fn apply(&self, id: OrderId, status: OrderStatus, entry: HistoryEntry) -> Result<()>;

    async fn get(&self, id: OrderId) -> Result<Option<OrderAggregate>>;

    async fn list(&self) -> Result<Vec<OrderAggregate>>;
}

/// In-memory order store for tests and local wiring.
#[derive(Clone)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<OrderId, OrderAggregate>>>,
    outbox: Arc<dyn OutboxStore>,
}

impl InMemoryOrderStore {
    pub fn new(outbox: Arc<dyn OutboxStore>) -> Self {
        Self {
            orders: Arc::new(RwLock::new(HashMap::new())),
            outbox,
        }
    }

    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create(
        &self,
        order: &OrderAggregate,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Result<()> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id) {
            return Err(SagaError::OrderAlreadyExists(order.id));
        }
        self.outbox.enqueue(topic, envelope).await?;
        orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn apply(&self, id: OrderId, status: OrderStatus, entry: HistoryEntry) -> Result<()> {
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(&id).ok_or(SagaError::OrderNotFound(id))?;
        if !OrderAggregate::transition_allowed(order.status, status) {
            return Err(SagaError::InvalidTransition {
                order_id: id,
                from: order.status,
                to: status,
            });
        }
        order.status = status;
        order.updated_at = entry.at;
        order.history.push(entry);
        Ok(())
    }

    async fn get(&self, id: OrderId) -> Result<Option<OrderAggregate>> {
        Ok(self.orders.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<OrderAggregate>> {
        let mut orders: Vec<_> = self.orders.read().await.values().cloned().collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::{EventPayload, OrderCreated};
    use messaging::InMemoryOutboxStore;

    fn sample_order() -> (OrderAggregate, EventEnvelope) {
        let id = OrderId::new();
        let items = vec![OrderItem {
            sku: "SKU-1".into(),
            qty: 2,
        }];
        let payload = EventPayload::OrderCreated(OrderCreated {
            order_id: id,
            items: items.clone(),
            total: 20,
        });
        let envelope = EventEnvelope::builder()
            .payload(&payload)
            .unwrap()
            .build()
            .unwrap();
        (
            OrderAggregate::new(id, items, 20, envelope.correlation_id),
            envelope,
        )
    }

    fn entry(event_type: &str, status: OrderStatus) -> HistoryEntry {
        HistoryEntry {
            event_type: event_type.to_string(),
            status,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_stages_event_and_persists_order() {
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let store = InMemoryOrderStore::new(outbox.clone());
        let (order, envelope) = sample_order();

        store
            .create(&order, envelope.topic(), &envelope)
            .await
            .unwrap();

        assert_eq!(store.order_count().await, 1);
        assert_eq!(outbox.pending_count().await, 1);
        let fetched = store.get(order.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, OrderStatus::Created);
        assert_eq!(fetched.history.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let store = InMemoryOrderStore::new(outbox);
        let (order, envelope) = sample_order();

        store
            .create(&order, envelope.topic(), &envelope)
            .await
            .unwrap();
        let err = store
            .create(&order, envelope.topic(), &envelope)
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::OrderAlreadyExists(_)));
    }

    #[tokio::test]
    async fn apply_walks_the_happy_path() {
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let store = InMemoryOrderStore::new(outbox);
        let (order, envelope) = sample_order();
        store
            .create(&order, envelope.topic(), &envelope)
            .await
            .unwrap();

        for (event_type, status) in [
            ("inventory.InventoryReserved.v1", OrderStatus::InventoryReserved),
            ("payment.PaymentAuthorized.v1", OrderStatus::PaymentAuthorized),
            ("shipping.OrderShipped.v1", OrderStatus::Shipped),
        ] {
            store
                .apply(order.id, status, entry(event_type, status))
                .await
                .unwrap();
        }

        let fetched = store.get(order.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, OrderStatus::Shipped);
        assert_eq!(fetched.history.len(), 4);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let store = InMemoryOrderStore::new(outbox);
        let (order, envelope) = sample_order();
        store
            .create(&order, envelope.topic(), &envelope)
            .await
            .unwrap();

        // Cannot ship an order whose payment was never authorized.
        let err = store
            .apply(
                order.id,
                OrderStatus::Shipped,
                entry("shipping.OrderShipped.v1", OrderStatus::Shipped),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidTransition { .. }));
    }

    #[test]
    fn retry_transitions_are_legal() {
        assert!(OrderAggregate::transition_allowed(
            OrderStatus::InventoryFailed,
            OrderStatus::InventoryReserved
        ));
        assert!(OrderAggregate::transition_allowed(
            OrderStatus::PaymentFailed,
            OrderStatus::PaymentAuthorized
        ));
        assert!(OrderAggregate::transition_allowed(
            OrderStatus::ShippingFailed,
            OrderStatus::Shipped
        ));
        // Released inventory after a payment failure reports as an
        // inventory failure.
        assert!(OrderAggregate::transition_allowed(
            OrderStatus::PaymentFailed,
            OrderStatus::InventoryFailed
        ));
    }

    #[test]
    fn settled_states_only_allow_the_refund_of_a_shipment() {
        // The one legal move out of a settled order: refunding a shipped
        // one.
        assert!(OrderAggregate::transition_allowed(
            OrderStatus::Shipped,
            OrderStatus::Refunded
        ));

        for target in [
            OrderStatus::Created,
            OrderStatus::InventoryReserved,
            OrderStatus::PaymentAuthorized,
            OrderStatus::Shipped,
        ] {
            assert!(!OrderAggregate::transition_allowed(OrderStatus::Shipped, target));
        }
        for target in [
            OrderStatus::Created,
            OrderStatus::InventoryReserved,
            OrderStatus::PaymentAuthorized,
            OrderStatus::Shipped,
            OrderStatus::Refunded,
        ] {
            assert!(!OrderAggregate::transition_allowed(OrderStatus::Refunded, target));
        }
    }

    #[tokio::test]
    async fn refund_settles_a_shipped_order() {
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let store = InMemoryOrderStore::new(outbox);
        let (order, envelope) = sample_order();
        store
            .create(&order, envelope.topic(), &envelope)
            .await
            .unwrap();

        for (event_type, status) in [
            ("inventory.InventoryReserved.v1", OrderStatus::InventoryReserved),
            ("payment.PaymentAuthorized.v1", OrderStatus::PaymentAuthorized),
            ("shipping.OrderShipped.v1", OrderStatus::Shipped),
            ("payment.PaymentRefunded.v1", OrderStatus::Refunded),
        ] {
            store
                .apply(order.id, status, entry(event_type, status))
                .await
                .unwrap();
        }

        let fetched = store.get(order.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, OrderStatus::Refunded);
        assert_eq!(fetched.history.len(), 5);
    }
}
