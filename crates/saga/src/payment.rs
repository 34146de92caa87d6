//! Payment service: authorizes the charge once inventory is held, stages
//! the compensations that unwind the saga, and executes refunds.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use common::OrderId;
use events::{
    CompensationAction, CompensationRequested, EventEnvelope, EventPayload, EventType,
    PaymentAuthorized, PaymentFailed, PaymentRefunded, RetryStep,
};
use messaging::{BoxError, EventHandler, OutboxStore};

use crate::error::{Result, SagaError};
use crate::inventory::ORDER_TOTAL_HEADER;

/// The authorization/refund decision, injected like the other services.
#[async_trait]
pub trait PaymentDecision: Send + Sync {
    /// Attempts to authorize `amount`; `Ok` carries the authorization id.
    async fn authorize(
        &self,
        order_id: OrderId,
        amount: i64,
    ) -> std::result::Result<String, String>;

    /// Refunds a previously authorized charge; `Ok` carries the refund id.
    async fn refund(&self, order_id: OrderId, amount: i64) -> std::result::Result<String, String>;
}

#[derive(Debug, Default)]
struct SimulatedPaymentsState {
    authorizations: HashMap<OrderId, (String, i64)>,
    next_auth: u32,
    next_refund: u32,
    fail_authorize: bool,
}

/// Deterministic in-memory payment provider.
#[derive(Debug, Clone, Default)]
pub struct SimulatedPayments {
    state: Arc<RwLock<SimulatedPaymentsState>>,
}

impl SimulatedPayments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_authorize(&self, fail: bool) {
        self.state.write().unwrap().fail_authorize = fail;
    }

    pub fn authorized_amount(&self, order_id: OrderId) -> Option<i64> {
        self.state
            .read()
            .unwrap()
            .authorizations
            .get(&order_id)
            .map(|(_, amount)| *amount)
    }
}

#[async_trait]
impl PaymentDecision for SimulatedPayments {
    async fn authorize(
        &self,
        order_id: OrderId,
        amount: i64,
    ) -> std::result::Result<String, String> {
        let mut state = self.state.write().unwrap();
        if state.fail_authorize {
            return Err("card declined".to_string());
        }
        state.next_auth += 1;
        let auth_id = format!("AUTH-{:04}", state.next_auth);
        state
            .authorizations
            .insert(order_id, (auth_id.clone(), amount));
        Ok(auth_id)
    }

    async fn refund(&self, order_id: OrderId, _amount: i64) -> std::result::Result<String, String> {
        let mut state = self.state.write().unwrap();
        if state.authorizations.remove(&order_id).is_none() {
            return Err("no authorization on file".to_string());
        }
        state.next_refund += 1;
        Ok(format!("REF-{:04}", state.next_refund))
    }
}

/// Consumer side of the payment service.
///
/// A declined authorization immediately stages the inventory release in
/// the same handling, so the reservation never dangles; a shipping
/// failure turns into a refund request the same way. Authorized amounts
/// are remembered until the charge is refunded, at which point the order
/// is settled and the entry is dropped.
pub struct PaymentHandler {
    decision: Arc<dyn PaymentDecision>,
    outbox: Arc<dyn OutboxStore>,
    amounts: RwLock<HashMap<OrderId, i64>>,
}

impl PaymentHandler {
    pub fn new(decision: Arc<dyn PaymentDecision>, outbox: Arc<dyn OutboxStore>) -> Self {
        Self {
            decision,
            outbox,
            amounts: RwLock::new(HashMap::new()),
        }
    }

    fn remembered_amount(&self, order_id: OrderId) -> Option<i64> {
        self.amounts.read().unwrap().get(&order_id).copied()
    }

    async fn run_authorization(
        &self,
        cause: &EventEnvelope,
        order_id: OrderId,
        amount: i64,
    ) -> Result<()> {
        match self.decision.authorize(order_id, amount).await {
            Ok(auth_id) => {
                let payload = EventPayload::PaymentAuthorized(PaymentAuthorized {
                    order_id,
                    amount,
                    auth_id,
                });
                let envelope = cause.follow(&payload)?;
                self.outbox.enqueue(envelope.topic(), &envelope).await?;
                metrics::counter!("payments_authorized_total").increment(1);
                tracing::info!(order_id = %order_id, amount, "payment authorized");
            }
            Err(reason) => {
                let failed = cause.follow(&EventPayload::PaymentFailed(PaymentFailed {
                    order_id,
                    reason: reason.clone(),
                }))?;
                self.outbox.enqueue(failed.topic(), &failed).await?;

                // The reservation behind this charge must not outlive the
                // declined payment.
                let release = cause.follow(&EventPayload::CompensationRequested(
                    CompensationRequested {
                        order_id,
                        action: CompensationAction::ReleaseInventory,
                    },
                ))?;
                self.outbox.enqueue(release.topic(), &release).await?;

                metrics::counter!("payments_failed_total").increment(1);
                tracing::warn!(order_id = %order_id, %reason, "payment declined");
            }
        }
        Ok(())
    }

    async fn run_refund(&self, cause: &EventEnvelope, order_id: OrderId) -> Result<()> {
        let amount = self
            .remembered_amount(order_id)
            .ok_or(SagaError::UnknownStep(order_id))?;
        let refund_id = self
            .decision
            .refund(order_id, amount)
            .await
            .map_err(SagaError::PaymentService)?;

        let payload = EventPayload::PaymentRefunded(PaymentRefunded {
            order_id,
            amount,
            refund_id,
        });
        let envelope = cause.follow(&payload)?;
        self.outbox.enqueue(envelope.topic(), &envelope).await?;
        self.amounts.write().unwrap().remove(&order_id);
        metrics::counter!("payments_refunded_total").increment(1);
        tracing::info!(order_id = %order_id, amount, "payment refunded");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for PaymentHandler {
    fn name(&self) -> &str {
        "payment-service"
    }

    fn topics(&self) -> Vec<&'static str> {
        vec![
            EventType::InventoryReserved.topic(),
            EventType::ShippingFailed.topic(),
            EventType::RetryRequested.topic(),
            EventType::CompensationRequested.topic(),
        ]
    }

    async fn handle(&self, envelope: &EventEnvelope) -> std::result::Result<(), BoxError> {
        match envelope.decode()? {
            EventPayload::InventoryReserved(p) => {
                let amount = envelope
                    .headers
                    .get(ORDER_TOTAL_HEADER)
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0);
                self.amounts.write().unwrap().insert(p.order_id, amount);
                self.run_authorization(envelope, p.order_id, amount).await?;
            }
            EventPayload::ShippingFailed(p) => {
                // Shipping could not complete; ask for the charge back.
                let refund = envelope.follow(&EventPayload::CompensationRequested(
                    CompensationRequested {
                        order_id: p.order_id,
                        action: CompensationAction::RefundPayment,
                    },
                ))?;
                self.outbox
                    .enqueue(refund.topic(), &refund)
                    .await
                    .map_err(SagaError::from)?;
                tracing::info!(order_id = %p.order_id, "refund compensation staged");
            }
            EventPayload::RetryRequested(p) => {
                if p.step == RetryStep::Payment {
                    let amount = self
                        .remembered_amount(p.order_id)
                        .ok_or(SagaError::UnknownStep(p.order_id))?;
                    self.run_authorization(envelope, p.order_id, amount).await?;
                }
            }
            EventPayload::CompensationRequested(p) => {
                if p.action == CompensationAction::RefundPayment {
                    self.run_refund(envelope, p.order_id).await?;
                }
            }
            EventPayload::OrderCreated(_)
            | EventPayload::InventoryFailed(_)
            | EventPayload::PaymentAuthorized(_)
            | EventPayload::PaymentFailed(_)
            | EventPayload::PaymentRefunded(_)
            | EventPayload::OrderShipped(_)
            | EventPayload::DeadLetter(_) => {
                tracing::warn!(event_type = %envelope.event_type, "unexpected event, ignoring");
            }
        }
        Ok(())
    }
}
