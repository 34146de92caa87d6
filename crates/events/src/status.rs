//! Order status vocabulary shared by the aggregate and the read model.

use serde::{Deserialize, Serialize};

/// The status of an order as it moves through the fulfillment saga.
///
/// Transitions (driven only by the order service's consumer):
/// ```text
/// CREATED ──► INVENTORY_RESERVED ──► PAYMENT_AUTHORIZED ──► SHIPPED
///    │                │                      │                 │
///    └► INVENTORY_FAILED  └► PAYMENT_FAILED      └► SHIPPING_FAILED ──► REFUNDED
/// ```
/// Failure states are sticky until an operator issues a retry or
/// compensation command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    InventoryReserved,
    InventoryFailed,
    PaymentAuthorized,
    PaymentFailed,
    Shipped,
    ShippingFailed,
    Refunded,
}

impl OrderStatus {
    /// Returns true if the order is stalled in a failure state.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            OrderStatus::InventoryFailed
                | OrderStatus::PaymentFailed
                | OrderStatus::ShippingFailed
        )
    }

    /// Returns true if no further forward step is expected without an
    /// operator command.
    pub fn is_settled(&self) -> bool {
        matches!(self, OrderStatus::Shipped | OrderStatus::Refunded) || self.is_failed()
    }

    /// Returns the status label as it appears in projections.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::InventoryReserved => "INVENTORY_RESERVED",
            OrderStatus::InventoryFailed => "INVENTORY_FAILED",
            OrderStatus::PaymentAuthorized => "PAYMENT_AUTHORIZED",
            OrderStatus::PaymentFailed => "PAYMENT_FAILED",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::ShippingFailed => "SHIPPING_FAILED",
            OrderStatus::Refunded => "REFUNDED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
