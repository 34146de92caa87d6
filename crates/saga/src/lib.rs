//! Choreographed order-fulfillment saga.
//!
//! Four participants react to each other's events over the broker with no
//! central coordinator: the order service owns the order record and folds
//! progress events into it, while the inventory, payment, and shipping
//! services execute their step when the preceding step's event arrives and
//! publish success or failure. Failures trigger compensation events that
//! unwind completed steps in reverse.

pub mod aggregate;
pub mod error;
pub mod inventory;
pub mod order;
pub mod payment;
pub mod postgres;
pub mod shipping;

pub use aggregate::{HistoryEntry, InMemoryOrderStore, OrderAggregate, OrderStore};
pub use error::{Result, SagaError};
pub use inventory::{InventoryDecision, InventoryHandler, SimulatedInventory};
pub use order::{OrderHandler, OrderService};
pub use payment::{PaymentDecision, PaymentHandler, SimulatedPayments};
pub use postgres::PostgresOrderStore;
pub use shipping::{ShipmentPlan, ShippingDecision, ShippingHandler, SimulatedShipping};
