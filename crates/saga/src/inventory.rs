//! Inventory service: reserves stock when an order is created and
//! releases it when compensation asks for it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use common::OrderId;
use events::{
    EventEnvelope, EventPayload, EventType, InventoryFailed, InventoryReserved, OrderItem,
    RetryStep,
};
use messaging::{BoxError, EventHandler, OutboxStore};

use crate::error::{Result, SagaError};

/// Header carrying the order total forward on `InventoryReserved`, so the
/// payment service can charge the right amount without re-reading the
/// order.
pub const ORDER_TOTAL_HEADER: &str = "orderTotal";

/// The decision a reservation attempt comes down to.
///
/// Injected so tests (and the demo wiring) control exactly which orders
/// succeed.
#[async_trait]
pub trait InventoryDecision: Send + Sync {
    /// Attempts the reservation; `Ok` carries the reservation id, `Err`
    /// the business reason it was declined.
    async fn reserve(
        &self,
        order_id: OrderId,
        items: &[OrderItem],
    ) -> std::result::Result<String, String>;

    /// Releases whatever is held for the order.
    async fn release(&self, order_id: OrderId) -> std::result::Result<(), String>;
}

#[derive(Debug, Default)]
struct SimulatedInventoryState {
    reservations: HashMap<OrderId, String>,
    next_id: u32,
    fail_reserve: bool,
}

/// Deterministic in-memory inventory with sequential reservation ids.
#[derive(Debug, Clone, Default)]
pub struct SimulatedInventory {
    state: Arc<RwLock<SimulatedInventoryState>>,
}

impl SimulatedInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent reserve calls fail until switched back.
    pub fn set_fail_reserve(&self, fail: bool) {
        self.state.write().unwrap().fail_reserve = fail;
    }

    pub fn reservation_count(&self) -> usize {
        self.state.read().unwrap().reservations.len()
    }

    pub fn has_reservation(&self, order_id: OrderId) -> bool {
        self.state.read().unwrap().reservations.contains_key(&order_id)
    }
}

#[async_trait]
impl InventoryDecision for SimulatedInventory {
    async fn reserve(
        &self,
        order_id: OrderId,
        _items: &[OrderItem],
    ) -> std::result::Result<String, String> {
        let mut state = self.state.write().unwrap();
        if state.fail_reserve {
            return Err("insufficient stock".to_string());
        }
        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state.reservations.insert(order_id, reservation_id.clone());
        Ok(reservation_id)
    }

    async fn release(&self, order_id: OrderId) -> std::result::Result<(), String> {
        self.state.write().unwrap().reservations.remove(&order_id);
        Ok(())
    }
}

/// Consumer side of the inventory service.
///
/// Remembers every reservation request it has seen so an operator retry
/// can replay the step without the command carrying the items again. The
/// requests stay for the life of the process, since a released
/// reservation may legally be retried at any later point; a restart
/// clears them, after which such a retry dead-letters as unknown.
pub struct InventoryHandler {
    decision: Arc<dyn InventoryDecision>,
    outbox: Arc<dyn OutboxStore>,
    requests: RwLock<HashMap<OrderId, (Vec<OrderItem>, i64)>>,
}

impl InventoryHandler {
    pub fn new(decision: Arc<dyn InventoryDecision>, outbox: Arc<dyn OutboxStore>) -> Self {
        Self {
            decision,
            outbox,
            requests: RwLock::new(HashMap::new()),
        }
    }

    async fn run_reservation(
        &self,
        cause: &EventEnvelope,
        order_id: OrderId,
        items: Vec<OrderItem>,
        total: i64,
    ) -> Result<()> {
        match self.decision.reserve(order_id, &items).await {
            Ok(reservation_id) => {
                let payload = EventPayload::InventoryReserved(InventoryReserved {
                    order_id,
                    reserved_items: items,
                });
                let envelope = EventEnvelope::builder()
                    .payload(&payload)?
                    .correlation_id(cause.correlation_id)
                    .causation_id(cause.event_id)
                    .header(ORDER_TOTAL_HEADER, total.to_string())
                    .build()?;
                self.outbox.enqueue(envelope.topic(), &envelope).await?;
                metrics::counter!("inventory_reservations_total").increment(1);
                tracing::info!(order_id = %order_id, %reservation_id, "inventory reserved");
            }
            Err(reason) => {
                let payload = EventPayload::InventoryFailed(InventoryFailed {
                    order_id,
                    reason: reason.clone(),
                });
                let envelope = cause.follow(&payload)?;
                self.outbox.enqueue(envelope.topic(), &envelope).await?;
                metrics::counter!("inventory_failures_total").increment(1);
                tracing::warn!(order_id = %order_id, %reason, "inventory reservation failed");
            }
        }
        Ok(())
    }

    fn remember(&self, order_id: OrderId, items: &[OrderItem], total: i64) {
        self.requests
            .write()
            .unwrap()
            .insert(order_id, (items.to_vec(), total));
    }

    fn recall(&self, order_id: OrderId) -> Option<(Vec<OrderItem>, i64)> {
        self.requests.read().unwrap().get(&order_id).cloned()
    }
}

#[async_trait]
impl EventHandler for InventoryHandler {
    fn name(&self) -> &str {
        "inventory-service"
    }

    fn topics(&self) -> Vec<&'static str> {
        vec![
            EventType::OrderCreated.topic(),
            EventType::RetryRequested.topic(),
            EventType::CompensationRequested.topic(),
        ]
    }

    async fn handle(&self, envelope: &EventEnvelope) -> std::result::Result<(), BoxError> {
        match envelope.decode()? {
            EventPayload::OrderCreated(p) => {
                self.remember(p.order_id, &p.items, p.total);
                self.run_reservation(envelope, p.order_id, p.items, p.total)
                    .await?;
            }
            EventPayload::RetryRequested(p) => {
                if p.step == RetryStep::Inventory {
                    let (items, total) = self
                        .recall(p.order_id)
                        .ok_or(SagaError::UnknownStep(p.order_id))?;
                    self.run_reservation(envelope, p.order_id, items, total)
                        .await?;
                }
            }
            EventPayload::CompensationRequested(p) => {
                if p.action == events::CompensationAction::ReleaseInventory {
                    self.decision
                        .release(p.order_id)
                        .await
                        .map_err(SagaError::InventoryService)?;
                    let payload = EventPayload::InventoryFailed(InventoryFailed {
                        order_id: p.order_id,
                        reason: "released".to_string(),
                    });
                    let out = envelope.follow(&payload).map_err(SagaError::from)?;
                    self.outbox
                        .enqueue(out.topic(), &out)
                        .await
                        .map_err(SagaError::from)?;
                    tracing::info!(order_id = %p.order_id, "inventory released");
                }
            }
            EventPayload::InventoryReserved(_)
            | EventPayload::InventoryFailed(_)
            | EventPayload::PaymentAuthorized(_)
            | EventPayload::PaymentFailed(_)
            | EventPayload::PaymentRefunded(_)
            | EventPayload::OrderShipped(_)
            | EventPayload::ShippingFailed(_)
            | EventPayload::DeadLetter(_) => {
                tracing::warn!(event_type = %envelope.event_type, "unexpected event, ignoring");
            }
        }
        Ok(())
    }
}
