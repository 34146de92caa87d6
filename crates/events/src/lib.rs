//! Canonical event vocabulary for the order fulfillment saga.
//!
//! Every message exchanged between the fulfillment services is an
//! [`EventEnvelope`] wrapping one of the payloads in the closed
//! [`EventPayload`] catalog. Payloads are validated against their schema
//! before they are ever staged for publication; an envelope that fails
//! [`EventEnvelope::validate`] never reaches the wire.
//!
//! Schema evolution is by versioned type name (`order.OrderCreated.v1`):
//! an incompatible payload change introduces a new `…v2` variant rather
//! than mutating an existing one, so historical events stay replayable.

pub mod catalog;
pub mod envelope;
pub mod error;
pub mod status;

pub use catalog::{
    CompensationAction, CompensationRequested, DeadLetter, EventPayload, EventType,
    InventoryFailed, InventoryReserved, OrderCreated, OrderItem, OrderShipped, PaymentAuthorized,
    PaymentFailed, PaymentRefunded, RetryRequested, RetryStep, ShippingFailed,
};
pub use envelope::{EventEnvelope, EventEnvelopeBuilder};
pub use error::ValidationError;
pub use status::OrderStatus;

/// Result type for envelope and schema operations.
pub type Result<T> = std::result::Result<T, ValidationError>;
