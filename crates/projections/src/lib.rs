//! Query side of the fulfillment saga.
//!
//! The projector consumes every domain event and maintains one
//! [`OrderProjection`] per order: the current status plus the full event
//! timeline. The [`SubscriptionHub`] fans each applied update out to live
//! subscribers, which is what the API's stream endpoint hangs off.

pub mod error;
pub mod hub;
pub mod postgres;
pub mod projection;
pub mod projector;

pub use error::{ProjectionError, Result};
pub use hub::{OrderUpdate, SubscriptionHub, UpdateStream};
pub use postgres::PostgresProjectionStore;
pub use projection::{InMemoryProjectionStore, OrderProjection, ProjectionStore, TimelineEntry};
pub use projector::Projector;
