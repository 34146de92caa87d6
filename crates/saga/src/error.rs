//! Saga error types.

use common::OrderId;
use events::OrderStatus;
use messaging::MessagingError;
use thiserror::Error;

/// Errors that can occur inside the saga participants.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Order not found.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// An order with this id already exists.
    #[error("Order already exists: {0}")]
    OrderAlreadyExists(OrderId),

    /// The event would move the order through an illegal transition.
    #[error("Invalid status transition for order {order_id}: {from} -> {to}")]
    InvalidTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    /// A retry or compensation referenced a step the service never saw.
    #[error("No recorded step for order {0}, cannot replay it")]
    UnknownStep(OrderId),

    /// Inventory service error.
    #[error("Inventory service error: {0}")]
    InventoryService(String),

    /// Payment service error.
    #[error("Payment service error: {0}")]
    PaymentService(String),

    /// Shipping service error.
    #[error("Shipping service error: {0}")]
    ShippingService(String),

    /// Messaging layer error.
    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    /// Event validation error.
    #[error("Validation error: {0}")]
    Validation(#[from] events::ValidationError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
