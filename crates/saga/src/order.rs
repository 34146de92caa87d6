//! Order service: the saga's entry point and its record keeper.

use std::sync::Arc;

use async_trait::async_trait;

use common::OrderId;
use events::{
    CompensationAction, CompensationRequested, EventEnvelope, EventPayload, EventType,
    OrderCreated, OrderItem, OrderStatus, RetryRequested, RetryStep,
};
use messaging::{BoxError, EventHandler, OutboxStore};

use crate::aggregate::{HistoryEntry, OrderAggregate, OrderStore};
use crate::error::{Result, SagaError};

/// Command side of the order service.
///
/// Creating an order writes the record and stages `OrderCreated` in one
/// atomic unit; retry and compensation are operator commands staged as
/// `ops.*` events on the order's existing correlation.
pub struct OrderService {
    store: Arc<dyn OrderStore>,
    outbox: Arc<dyn OutboxStore>,
}

impl OrderService {
    pub fn new(store: Arc<dyn OrderStore>, outbox: Arc<dyn OutboxStore>) -> Self {
        Self { store, outbox }
    }

    #[tracing::instrument(skip(self, items))]
    pub async fn create_order(&self, items: Vec<OrderItem>, total: i64) -> Result<OrderAggregate> {
        let order_id = OrderId::new();
        let payload = EventPayload::OrderCreated(OrderCreated {
            order_id,
            items: items.clone(),
            total,
        });
        let envelope = EventEnvelope::builder().payload(&payload)?.build()?;

        let order = OrderAggregate::new(order_id, items, total, envelope.correlation_id);
        self.store
            .create(&order, envelope.topic(), &envelope)
            .await?;

        metrics::counter!("orders_created_total").increment(1);
        tracing::info!(order_id = %order_id, total, "order created");
        Ok(order)
    }

    /// Asks the service owning `step` to run it again.
    pub async fn request_retry(&self, order_id: OrderId, step: RetryStep) -> Result<EventEnvelope> {
        let order = self
            .store
            .get(order_id)
            .await?
            .ok_or(SagaError::OrderNotFound(order_id))?;

        let payload = EventPayload::RetryRequested(RetryRequested { order_id, step });
        let envelope = EventEnvelope::builder()
            .payload(&payload)?
            .correlation_id(order.correlation_id)
            .build()?;
        self.outbox.enqueue(envelope.topic(), &envelope).await?;
        tracing::info!(order_id = %order_id, ?step, "retry requested");
        Ok(envelope)
    }

    /// Asks for a completed step to be undone.
    pub async fn request_compensation(
        &self,
        order_id: OrderId,
        action: CompensationAction,
    ) -> Result<EventEnvelope> {
        let order = self
            .store
            .get(order_id)
            .await?
            .ok_or(SagaError::OrderNotFound(order_id))?;

        let payload = EventPayload::CompensationRequested(CompensationRequested { order_id, action });
        let envelope = EventEnvelope::builder()
            .payload(&payload)?
            .correlation_id(order.correlation_id)
            .build()?;
        self.outbox.enqueue(envelope.topic(), &envelope).await?;
        tracing::info!(order_id = %order_id, ?action, "compensation requested");
        Ok(envelope)
    }

    pub async fn get_order(&self, order_id: OrderId) -> Result<Option<OrderAggregate>> {
        self.store.get(order_id).await
    }

    pub async fn list_orders(&self) -> Result<Vec<OrderAggregate>> {
        self.store.list().await
    }
}

/// Consumer side of the order service: folds every downstream progress
/// event into the order record.
pub struct OrderHandler {
    store: Arc<dyn OrderStore>,
}

impl OrderHandler {
    pub fn new(store: Arc<dyn OrderStore>) -> Self {
        Self { store }
    }

    async fn fold(
        &self,
        envelope: &EventEnvelope,
        order_id: OrderId,
        status: OrderStatus,
    ) -> Result<()> {
        self.store
            .apply(
                order_id,
                status,
                HistoryEntry {
                    event_type: envelope.event_type.clone(),
                    status,
                    at: envelope.timestamp,
                },
            )
            .await?;
        tracing::info!(order_id = %order_id, status = %status, "order status updated");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for OrderHandler {
    fn name(&self) -> &str {
        "order-service"
    }

    fn topics(&self) -> Vec<&'static str> {
        vec![
            EventType::InventoryReserved.topic(),
            EventType::InventoryFailed.topic(),
            EventType::PaymentAuthorized.topic(),
            EventType::PaymentFailed.topic(),
            EventType::PaymentRefunded.topic(),
            EventType::OrderShipped.topic(),
            EventType::ShippingFailed.topic(),
        ]
    }

    async fn handle(&self, envelope: &EventEnvelope) -> std::result::Result<(), BoxError> {
        match envelope.decode()? {
            EventPayload::InventoryReserved(p) => {
                self.fold(envelope, p.order_id, OrderStatus::InventoryReserved)
                    .await?
            }
            EventPayload::InventoryFailed(p) => {
                self.fold(envelope, p.order_id, OrderStatus::InventoryFailed)
                    .await?
            }
            EventPayload::PaymentAuthorized(p) => {
                self.fold(envelope, p.order_id, OrderStatus::PaymentAuthorized)
                    .await?
            }
            EventPayload::PaymentFailed(p) => {
                self.fold(envelope, p.order_id, OrderStatus::PaymentFailed)
                    .await?
            }
            EventPayload::PaymentRefunded(p) => {
                self.fold(envelope, p.order_id, OrderStatus::Refunded).await?
            }
            EventPayload::OrderShipped(p) => {
                self.fold(envelope, p.order_id, OrderStatus::Shipped).await?
            }
            EventPayload::ShippingFailed(p) => {
                self.fold(envelope, p.order_id, OrderStatus::ShippingFailed)
                    .await?
            }
            // Not subscribed; reaching here means a mis-wired topic.
            EventPayload::OrderCreated(_)
            | EventPayload::RetryRequested(_)
            | EventPayload::CompensationRequested(_)
            | EventPayload::DeadLetter(_) => {
                tracing::warn!(event_type = %envelope.event_type, "unexpected event, ignoring");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::InMemoryOrderStore;
    use events::InventoryReserved;
    use messaging::InMemoryOutboxStore;

    fn items() -> Vec<OrderItem> {
        vec![OrderItem {
            sku: "SKU-1".into(),
            qty: 2,
        }]
    }

    fn service() -> (OrderService, Arc<InMemoryOrderStore>, Arc<InMemoryOutboxStore>) {
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let store = Arc::new(InMemoryOrderStore::new(outbox.clone()));
        (
            OrderService::new(store.clone(), outbox.clone()),
            store,
            outbox,
        )
    }

    #[tokio::test]
    async fn create_order_stages_order_created() {
        let (service, _, outbox) = service();
        let order = service.create_order(items(), 20).await.unwrap();

        assert_eq!(order.status, OrderStatus::Created);
        let pending = outbox.pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].topic, "order.OrderCreated.v1");
        assert_eq!(pending[0].envelope.key, order.id.to_string());
    }

    #[tokio::test]
    async fn retry_keeps_the_order_correlation() {
        let (service, _, outbox) = service();
        let order = service.create_order(items(), 20).await.unwrap();

        let envelope = service
            .request_retry(order.id, RetryStep::Inventory)
            .await
            .unwrap();
        assert_eq!(envelope.correlation_id, order.correlation_id);
        assert_eq!(envelope.topic(), "ops.RetryRequested.v1");
        assert_eq!(outbox.pending_count().await, 2);
    }

    #[tokio::test]
    async fn retry_for_unknown_order_fails() {
        let (service, _, _) = service();
        let err = service
            .request_retry(OrderId::new(), RetryStep::Payment)
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::OrderNotFound(_)));
    }

    #[tokio::test]
    async fn handler_folds_progress_events() {
        let (service, store, _) = service();
        let order = service.create_order(items(), 20).await.unwrap();
        let handler = OrderHandler::new(store.clone());

        let payload = EventPayload::InventoryReserved(InventoryReserved {
            order_id: order.id,
            reserved_items: items(),
        });
        let envelope = EventEnvelope::builder()
            .payload(&payload)
            .unwrap()
            .correlation_id(order.correlation_id)
            .build()
            .unwrap();
        handler.handle(&envelope).await.unwrap();

        let fetched = store.get(order.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, OrderStatus::InventoryReserved);
        assert_eq!(fetched.history.len(), 2);
    }
}
