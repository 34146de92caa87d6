//! Messaging error types.

use events::ValidationError;
use thiserror::Error;

/// Boxed error type returned by event handlers.
///
/// Handlers live in other crates with their own error enums; the consumer
/// loop only needs the error text to dead-letter the message.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur inside the coordination machinery.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// The broker rejected or could not accept a publish. Transient: the
    /// dispatcher records it and retries on the next tick.
    #[error("broker error: {0}")]
    Broker(String),

    /// A database error occurred in a durable store.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The envelope failed schema validation and was rejected before
    /// staging.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Staging a dead letter failed. This is the one fatal class: it
    /// propagates and halts the affected consumer, because silently losing
    /// a poison message is worse than stalling.
    #[error("dead letter staging failed: {0}")]
    DeadLetterStaging(#[source] Box<MessagingError>),
}

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;
