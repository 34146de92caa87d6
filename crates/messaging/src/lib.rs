//! Event-driven coordination machinery shared by every saga participant.
//!
//! This crate provides the pieces that make choreography safe on top of an
//! at-least-once broker:
//!
//! - [`Broker`] — the publish/subscribe seam, with an in-memory
//!   implementation that preserves per-key ordering.
//! - [`OutboxStore`] and [`OutboxDispatcher`] — durable staging written
//!   alongside business state, drained to the broker by a background task,
//!   closing the dual-write gap between a local commit and a publish.
//! - [`with_idempotency`] — the consumption guard that makes duplicate
//!   delivery a no-op while still letting failed work be retried.
//! - [`ConsumerLoop`] and [`DeadLetterRouter`] — the per-service receive
//!   path: parse, dedup, handle, and isolate poison messages on a
//!   `<topic>.dlq` channel instead of blocking the stream.

pub mod broker;
pub mod consumer;
pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod idempotency;
pub mod outbox;
pub mod postgres;

pub use broker::{Broker, Delivery, InMemoryBroker, Subscription};
pub use consumer::{ConsumerLoop, EventHandler};
pub use dead_letter::{DeadLetterRouter, dlq_topic};
pub use dispatcher::OutboxDispatcher;
pub use error::{BoxError, MessagingError, Result};
pub use idempotency::{
    IdempotencyOutcome, InMemoryProcessedStore, ProcessedStore, with_idempotency,
};
pub use outbox::{InMemoryOutboxStore, OutboxRecord, OutboxStore};
pub use postgres::{PostgresOutboxStore, PostgresProcessedStore, run_migrations};
