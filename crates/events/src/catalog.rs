//! The closed catalog of event types and their payload schemas.
//!
//! Each wire type name is `<domain>.<Name>.v<version>`; the topic an event
//! is published to is simply its type name, and the dead-letter channel
//! for a topic is `<topic>.dlq`.

use common::OrderId;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Every event kind the saga knows about.
///
/// Adding a catalog entry means adding a variant here and a payload arm in
/// [`EventPayload`]; every consumer match is exhaustive, so the compiler
/// points at each handler that needs a decision for the new kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    OrderCreated,
    InventoryReserved,
    InventoryFailed,
    PaymentAuthorized,
    PaymentFailed,
    PaymentRefunded,
    OrderShipped,
    ShippingFailed,
    RetryRequested,
    CompensationRequested,
    DeadLetter,
}

impl EventType {
    /// All catalog entries, useful for subscription lists.
    pub const ALL: [EventType; 11] = [
        EventType::OrderCreated,
        EventType::InventoryReserved,
        EventType::InventoryFailed,
        EventType::PaymentAuthorized,
        EventType::PaymentFailed,
        EventType::PaymentRefunded,
        EventType::OrderShipped,
        EventType::ShippingFailed,
        EventType::RetryRequested,
        EventType::CompensationRequested,
        EventType::DeadLetter,
    ];

    /// The domain events that describe order progress (everything except
    /// the ops command and dead-letter channels).
    pub const DOMAIN: [EventType; 8] = [
        EventType::OrderCreated,
        EventType::InventoryReserved,
        EventType::InventoryFailed,
        EventType::PaymentAuthorized,
        EventType::PaymentFailed,
        EventType::PaymentRefunded,
        EventType::OrderShipped,
        EventType::ShippingFailed,
    ];

    /// Returns the versioned wire name, e.g. `order.OrderCreated.v1`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OrderCreated => "order.OrderCreated.v1",
            EventType::InventoryReserved => "inventory.InventoryReserved.v1",
            EventType::InventoryFailed => "inventory.InventoryFailed.v1",
            EventType::PaymentAuthorized => "payment.PaymentAuthorized.v1",
            EventType::PaymentFailed => "payment.PaymentFailed.v1",
            EventType::PaymentRefunded => "payment.PaymentRefunded.v1",
            EventType::OrderShipped => "shipping.OrderShipped.v1",
            EventType::ShippingFailed => "shipping.ShippingFailed.v1",
            EventType::RetryRequested => "ops.RetryRequested.v1",
            EventType::CompensationRequested => "ops.CompensationRequested.v1",
            EventType::DeadLetter => "ops.DeadLetter.v1",
        }
    }

    /// The topic this event kind is published to (one topic per type).
    pub fn topic(&self) -> &'static str {
        self.as_str()
    }

    /// Looks a type up by its wire name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }

    /// The schema version encoded in the type name suffix.
    pub fn schema_version(&self) -> u32 {
        1
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| ValidationError::UnknownType(s.to_string()))
    }
}

/// A line item on an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub sku: String,
    pub qty: u32,
}

/// Payload of `order.OrderCreated.v1`. Amounts are in minor currency units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub items: Vec<OrderItem>,
    pub total: i64,
}

/// Payload of `inventory.InventoryReserved.v1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryReserved {
    pub order_id: OrderId,
    pub reserved_items: Vec<OrderItem>,
}

/// Payload of `inventory.InventoryFailed.v1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryFailed {
    pub order_id: OrderId,
    pub reason: String,
}

/// Payload of `payment.PaymentAuthorized.v1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAuthorized {
    pub order_id: OrderId,
    pub amount: i64,
    pub auth_id: String,
}

/// Payload of `payment.PaymentFailed.v1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFailed {
    pub order_id: OrderId,
    pub reason: String,
}

/// Payload of `payment.PaymentRefunded.v1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRefunded {
    pub order_id: OrderId,
    pub amount: i64,
    pub refund_id: String,
}

/// Payload of `shipping.OrderShipped.v1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderShipped {
    pub order_id: OrderId,
    pub carrier: String,
    pub tracking_id: String,
}

/// Payload of `shipping.ShippingFailed.v1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingFailed {
    pub order_id: OrderId,
    pub reason: String,
}

/// Which saga step an operator retry targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStep {
    Inventory,
    Payment,
    Shipping,
}

/// Payload of `ops.RetryRequested.v1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequested {
    pub order_id: OrderId,
    pub step: RetryStep,
}

/// The corrective action a compensation request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompensationAction {
    ReleaseInventory,
    RefundPayment,
}

/// Payload of `ops.CompensationRequested.v1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationRequested {
    pub order_id: OrderId,
    pub action: CompensationAction,
}

/// Payload of `ops.DeadLetter.v1`.
///
/// `order_id` is best-effort: a message that cannot even be parsed still
/// produces a dead letter, just without an order id. Identifiers are plain
/// strings because the offending message may not contain valid UUIDs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub original_type: String,
    pub original_event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub error: String,
    pub payload: serde_json::Value,
}

/// The closed union of every payload in the catalog.
#[derive(Debug, Clone)]
pub enum EventPayload {
    OrderCreated(OrderCreated),
    InventoryReserved(InventoryReserved),
    InventoryFailed(InventoryFailed),
    PaymentAuthorized(PaymentAuthorized),
    PaymentFailed(PaymentFailed),
    PaymentRefunded(PaymentRefunded),
    OrderShipped(OrderShipped),
    ShippingFailed(ShippingFailed),
    RetryRequested(RetryRequested),
    CompensationRequested(CompensationRequested),
    DeadLetter(DeadLetter),
}

impl EventPayload {
    /// The catalog entry this payload belongs to.
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::OrderCreated(_) => EventType::OrderCreated,
            EventPayload::InventoryReserved(_) => EventType::InventoryReserved,
            EventPayload::InventoryFailed(_) => EventType::InventoryFailed,
            EventPayload::PaymentAuthorized(_) => EventType::PaymentAuthorized,
            EventPayload::PaymentFailed(_) => EventType::PaymentFailed,
            EventPayload::PaymentRefunded(_) => EventType::PaymentRefunded,
            EventPayload::OrderShipped(_) => EventType::OrderShipped,
            EventPayload::ShippingFailed(_) => EventType::ShippingFailed,
            EventPayload::RetryRequested(_) => EventType::RetryRequested,
            EventPayload::CompensationRequested(_) => EventType::CompensationRequested,
            EventPayload::DeadLetter(_) => EventType::DeadLetter,
        }
    }

    /// The order this payload concerns, if it carries one.
    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            EventPayload::OrderCreated(p) => Some(p.order_id),
            EventPayload::InventoryReserved(p) => Some(p.order_id),
            EventPayload::InventoryFailed(p) => Some(p.order_id),
            EventPayload::PaymentAuthorized(p) => Some(p.order_id),
            EventPayload::PaymentFailed(p) => Some(p.order_id),
            EventPayload::PaymentRefunded(p) => Some(p.order_id),
            EventPayload::OrderShipped(p) => Some(p.order_id),
            EventPayload::ShippingFailed(p) => Some(p.order_id),
            EventPayload::RetryRequested(p) => Some(p.order_id),
            EventPayload::CompensationRequested(p) => Some(p.order_id),
            EventPayload::DeadLetter(p) => {
                p.order_id.as_deref().and_then(|s| s.parse().ok())
            }
        }
    }

    /// Serializes the payload to its wire JSON shape.
    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            EventPayload::OrderCreated(p) => serde_json::to_value(p),
            EventPayload::InventoryReserved(p) => serde_json::to_value(p),
            EventPayload::InventoryFailed(p) => serde_json::to_value(p),
            EventPayload::PaymentAuthorized(p) => serde_json::to_value(p),
            EventPayload::PaymentFailed(p) => serde_json::to_value(p),
            EventPayload::PaymentRefunded(p) => serde_json::to_value(p),
            EventPayload::OrderShipped(p) => serde_json::to_value(p),
            EventPayload::ShippingFailed(p) => serde_json::to_value(p),
            EventPayload::RetryRequested(p) => serde_json::to_value(p),
            EventPayload::CompensationRequested(p) => serde_json::to_value(p),
            EventPayload::DeadLetter(p) => serde_json::to_value(p),
        }
    }

    /// Decodes and validates a payload for the given type.
    pub fn decode(
        event_type: EventType,
        payload: &serde_json::Value,
    ) -> Result<Self, ValidationError> {
        let decoded = match event_type {
            EventType::OrderCreated => {
                EventPayload::OrderCreated(serde_json::from_value(payload.clone())?)
            }
            EventType::InventoryReserved => {
                EventPayload::InventoryReserved(serde_json::from_value(payload.clone())?)
            }
            EventType::InventoryFailed => {
                EventPayload::InventoryFailed(serde_json::from_value(payload.clone())?)
            }
            EventType::PaymentAuthorized => {
                EventPayload::PaymentAuthorized(serde_json::from_value(payload.clone())?)
            }
            EventType::PaymentFailed => {
                EventPayload::PaymentFailed(serde_json::from_value(payload.clone())?)
            }
            EventType::PaymentRefunded => {
                EventPayload::PaymentRefunded(serde_json::from_value(payload.clone())?)
            }
            EventType::OrderShipped => {
                EventPayload::OrderShipped(serde_json::from_value(payload.clone())?)
            }
            EventType::ShippingFailed => {
                EventPayload::ShippingFailed(serde_json::from_value(payload.clone())?)
            }
            EventType::RetryRequested => {
                EventPayload::RetryRequested(serde_json::from_value(payload.clone())?)
            }
            EventType::CompensationRequested => {
                EventPayload::CompensationRequested(serde_json::from_value(payload.clone())?)
            }
            EventType::DeadLetter => {
                EventPayload::DeadLetter(serde_json::from_value(payload.clone())?)
            }
        };
        decoded.validate()?;
        Ok(decoded)
    }

    /// Checks the semantic rules the type structure alone cannot express.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let event_type = self.event_type();
        match self {
            EventPayload::OrderCreated(p) => {
                validate_items(event_type, "items", &p.items)?;
                validate_amount(event_type, "total", p.total)
            }
            EventPayload::InventoryReserved(p) => {
                validate_items(event_type, "reservedItems", &p.reserved_items)
            }
            EventPayload::PaymentAuthorized(p) => validate_amount(event_type, "amount", p.amount),
            EventPayload::PaymentRefunded(p) => validate_amount(event_type, "amount", p.amount),
            EventPayload::InventoryFailed(_)
            | EventPayload::PaymentFailed(_)
            | EventPayload::OrderShipped(_)
            | EventPayload::ShippingFailed(_)
            | EventPayload::RetryRequested(_)
            | EventPayload::CompensationRequested(_)
            | EventPayload::DeadLetter(_) => Ok(()),
        }
    }
}

fn validate_items(
    event_type: EventType,
    field: &str,
    items: &[OrderItem],
) -> Result<(), ValidationError> {
    for item in items {
        if item.qty == 0 {
            return Err(ValidationError::invalid(
                event_type.as_str(),
                format!("{field}: qty must be positive for sku {}", item.sku),
            ));
        }
    }
    Ok(())
}

fn validate_amount(event_type: EventType, field: &str, amount: i64) -> Result<(), ValidationError> {
    if amount < 0 {
        return Err(ValidationError::invalid(
            event_type.as_str(),
            format!("{field} must be non-negative, got {amount}"),
        ));
    }
    Ok(())
}
