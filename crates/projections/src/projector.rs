//! The projector: the read model's consumer.

use std::sync::Arc;

use async_trait::async_trait;

use events::{EventEnvelope, EventPayload, EventType, OrderStatus};
use messaging::{BoxError, EventHandler};

use crate::hub::{OrderUpdate, SubscriptionHub};
use crate::projection::{ProjectionStore, TimelineEntry};

/// Folds every domain event into the projection store and pushes the
/// resulting update to live watchers.
pub struct Projector {
    store: Arc<dyn ProjectionStore>,
    hub: Arc<SubscriptionHub>,
}

impl Projector {
    pub fn new(store: Arc<dyn ProjectionStore>, hub: Arc<SubscriptionHub>) -> Self {
        Self { store, hub }
    }

    /// The status a projected order shows after this event.
    fn status_for(payload: &EventPayload) -> Option<OrderStatus> {
        match payload {
            EventPayload::OrderCreated(_) => Some(OrderStatus::Created),
            EventPayload::InventoryReserved(_) => Some(OrderStatus::InventoryReserved),
            EventPayload::InventoryFailed(_) => Some(OrderStatus::InventoryFailed),
            EventPayload::PaymentAuthorized(_) => Some(OrderStatus::PaymentAuthorized),
            EventPayload::PaymentFailed(_) => Some(OrderStatus::PaymentFailed),
            EventPayload::PaymentRefunded(_) => Some(OrderStatus::Refunded),
            EventPayload::OrderShipped(_) => Some(OrderStatus::Shipped),
            EventPayload::ShippingFailed(_) => Some(OrderStatus::ShippingFailed),
            // Command and dead-letter traffic is not part of an order's
            // public timeline.
            EventPayload::RetryRequested(_)
            | EventPayload::CompensationRequested(_)
            | EventPayload::DeadLetter(_) => None,
        }
    }
}

#[async_trait]
impl EventHandler for Projector {
    fn name(&self) -> &str {
        "projector"
    }

    fn topics(&self) -> Vec<&'static str> {
        EventType::DOMAIN.iter().map(|t| t.topic()).collect()
    }

    async fn handle(&self, envelope: &EventEnvelope) -> std::result::Result<(), BoxError> {
        let payload = envelope.decode()?;
        let Some(status) = Self::status_for(&payload) else {
            tracing::warn!(event_type = %envelope.event_type, "event not projected, ignoring");
            return Ok(());
        };
        let Some(order_id) = payload.order_id() else {
            return Ok(());
        };

        let entry = TimelineEntry {
            event_type: envelope.event_type.clone(),
            at: envelope.timestamp,
            details: envelope.payload.clone(),
        };
        let projection = self.store.apply(order_id, status, entry.clone()).await?;

        self.hub.publish(OrderUpdate {
            order_id,
            event_type: entry.event_type,
            status: projection.current_status,
            at: entry.at,
            details: entry.details,
        });

        metrics::counter!("events_projected_total").increment(1);
        tracing::debug!(order_id = %order_id, status = %status, "projection updated");
        Ok(())
    }
}
