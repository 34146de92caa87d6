//! Shipping service: books the shipment once payment clears.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use common::OrderId;
use events::{
    EventEnvelope, EventPayload, EventType, OrderShipped, RetryStep, ShippingFailed,
};
use messaging::{BoxError, EventHandler, OutboxStore};

use crate::error::{Result, SagaError};

/// A booked shipment.
#[derive(Debug, Clone)]
pub struct ShipmentPlan {
    pub carrier: String,
    pub tracking_id: String,
}

/// The booking decision, injected like the other services.
#[async_trait]
pub trait ShippingDecision: Send + Sync {
    /// Attempts to book the shipment; `Err` carries the business reason.
    async fn ship(&self, order_id: OrderId) -> std::result::Result<ShipmentPlan, String>;
}

#[derive(Debug, Default)]
struct SimulatedShippingState {
    next_id: u32,
    fail_ship: bool,
}

/// Deterministic in-memory carrier with sequential tracking ids.
#[derive(Debug, Clone, Default)]
pub struct SimulatedShipping {
    state: Arc<RwLock<SimulatedShippingState>>,
}

impl SimulatedShipping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_ship(&self, fail: bool) {
        self.state.write().unwrap().fail_ship = fail;
    }
}

#[async_trait]
impl ShippingDecision for SimulatedShipping {
    async fn ship(&self, _order_id: OrderId) -> std::result::Result<ShipmentPlan, String> {
        let mut state = self.state.write().unwrap();
        if state.fail_ship {
            return Err("no carrier capacity".to_string());
        }
        state.next_id += 1;
        Ok(ShipmentPlan {
            carrier: "UPS".to_string(),
            tracking_id: format!("TRK-{:04}", state.next_id),
        })
    }
}

/// Consumer side of the shipping service.
///
/// Orders are remembered while a booking is outstanding so an operator
/// retry can replay the step; a successful booking drops the entry.
pub struct ShippingHandler {
    decision: Arc<dyn ShippingDecision>,
    outbox: Arc<dyn OutboxStore>,
    requested: RwLock<HashSet<OrderId>>,
}

impl ShippingHandler {
    pub fn new(decision: Arc<dyn ShippingDecision>, outbox: Arc<dyn OutboxStore>) -> Self {
        Self {
            decision,
            outbox,
            requested: RwLock::new(HashSet::new()),
        }
    }

    async fn run_shipment(&self, cause: &EventEnvelope, order_id: OrderId) -> Result<()> {
        match self.decision.ship(order_id).await {
            Ok(plan) => {
                let payload = EventPayload::OrderShipped(OrderShipped {
                    order_id,
                    carrier: plan.carrier,
                    tracking_id: plan.tracking_id.clone(),
                });
                let envelope = cause.follow(&payload)?;
                self.outbox.enqueue(envelope.topic(), &envelope).await?;
                self.requested.write().unwrap().remove(&order_id);
                metrics::counter!("orders_shipped_total").increment(1);
                tracing::info!(order_id = %order_id, tracking_id = %plan.tracking_id, "order shipped");
            }
            Err(reason) => {
                let payload = EventPayload::ShippingFailed(ShippingFailed {
                    order_id,
                    reason: reason.clone(),
                });
                let envelope = cause.follow(&payload)?;
                self.outbox.enqueue(envelope.topic(), &envelope).await?;
                metrics::counter!("shipping_failures_total").increment(1);
                tracing::warn!(order_id = %order_id, %reason, "shipping failed");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for ShippingHandler {
    fn name(&self) -> &str {
        "shipping-service"
    }

    fn topics(&self) -> Vec<&'static str> {
        vec![
            EventType::PaymentAuthorized.topic(),
            EventType::RetryRequested.topic(),
        ]
    }

    async fn handle(&self, envelope: &EventEnvelope) -> std::result::Result<(), BoxError> {
        match envelope.decode()? {
            EventPayload::PaymentAuthorized(p) => {
                self.requested.write().unwrap().insert(p.order_id);
                self.run_shipment(envelope, p.order_id).await?;
            }
            EventPayload::RetryRequested(p) => {
                if p.step == RetryStep::Shipping {
                    if !self.requested.read().unwrap().contains(&p.order_id) {
                        return Err(SagaError::UnknownStep(p.order_id).into());
                    }
                    self.run_shipment(envelope, p.order_id).await?;
                }
            }
            EventPayload::OrderCreated(_)
            | EventPayload::InventoryReserved(_)
            | EventPayload::InventoryFailed(_)
            | EventPayload::PaymentFailed(_)
            | EventPayload::PaymentRefunded(_)
            | EventPayload::OrderShipped(_)
            | EventPayload::ShippingFailed(_)
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
    use events::{PaymentAuthorized, RetryRequested};
    use messaging::{InMemoryOutboxStore, OutboxStore};

    fn authorized(order_id: OrderId) -> EventEnvelope {
        EventEnvelope::builder()
            .payload(&EventPayload::PaymentAuthorized(PaymentAuthorized {
                order_id,
                amount: 100,
                auth_id: "AUTH-0001".into(),
            }))
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn ships_after_payment_authorized() {
        let shipping = Arc::new(SimulatedShipping::new());
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let handler = ShippingHandler::new(shipping, outbox.clone());

        let order_id = OrderId::new();
        handler.handle(&authorized(order_id)).await.unwrap();

        let pending = outbox.pending(10).await.unwrap();
        assert_eq!(pending[0].topic, "shipping.OrderShipped.v1");
        let EventPayload::OrderShipped(shipped) = pending[0].envelope.decode().unwrap() else {
            panic!("expected shipment");
        };
        assert_eq!(shipped.carrier, "UPS");
        assert!(shipped.tracking_id.starts_with("TRK-"));
    }

    #[tokio::test]
    async fn booking_failure_emits_shipping_failed() {
        let shipping = Arc::new(SimulatedShipping::new());
        shipping.set_fail_ship(true);
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let handler = ShippingHandler::new(shipping, outbox.clone());

        handler.handle(&authorized(OrderId::new())).await.unwrap();

        let pending = outbox.pending(10).await.unwrap();
        assert_eq!(pending[0].topic, "shipping.ShippingFailed.v1");
    }

    #[tokio::test]
    async fn retry_rebooks_a_seen_order() {
        let shipping = Arc::new(SimulatedShipping::new());
        shipping.set_fail_ship(true);
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let handler = ShippingHandler::new(shipping.clone(), outbox.clone());

        let order_id = OrderId::new();
        let cause = authorized(order_id);
        handler.handle(&cause).await.unwrap();

        shipping.set_fail_ship(false);
        let retry = cause
            .follow(&EventPayload::RetryRequested(RetryRequested {
                order_id,
                step: RetryStep::Shipping,
            }))
            .unwrap();
        handler.handle(&retry).await.unwrap();

        let pending = outbox.pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].topic, "shipping.OrderShipped.v1");
    }

    #[tokio::test]
    async fn retry_after_successful_shipment_errors() {
        let shipping = Arc::new(SimulatedShipping::new());
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let handler = ShippingHandler::new(shipping, outbox.clone());

        let order_id = OrderId::new();
        let cause = authorized(order_id);
        handler.handle(&cause).await.unwrap();

        // The booking settled the step; a late retry no longer finds it.
        let retry = cause
            .follow(&EventPayload::RetryRequested(RetryRequested {
                order_id,
                step: RetryStep::Shipping,
            }))
            .unwrap();
        assert!(handler.handle(&retry).await.is_err());
        assert_eq!(outbox.pending_count().await, 1);
    }

    #[tokio::test]
    async fn retry_for_unseen_order_errors() {
        let handler = ShippingHandler::new(
            Arc::new(SimulatedShipping::new()),
            Arc::new(InMemoryOutboxStore::new()),
        );
        let retry = EventEnvelope::builder()
            .payload(&EventPayload::RetryRequested(RetryRequested {
                order_id: OrderId::new(),
                step: RetryStep::Shipping,
            }))
            .unwrap()
            .build()
            .unwrap();
        assert!(handler.handle(&retry).await.is_err());
    }
}
