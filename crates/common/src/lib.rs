//! Shared identifier types used across the fulfillment services.

mod types;

pub use types::{EventId, OrderId};
