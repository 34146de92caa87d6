//! Schema validation errors.

use thiserror::Error;

/// Errors raised while validating an envelope against the event catalog.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The envelope's `type` does not name a registered schema.
    #[error("unknown event type: {0}")]
    UnknownType(String),

    /// The payload does not conform to the schema for its type.
    #[error("invalid payload for {event_type}: {reason}")]
    InvalidPayload { event_type: String, reason: String },

    /// The payload could not be serialized or deserialized at all.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ValidationError {
    /// Shorthand for a structured payload violation.
    pub fn invalid(event_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            event_type: event_type.into(),
            reason: reason.into(),
        }
    }
}
