//! The canonical event envelope.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::EventId;
use serde::{Deserialize, Serialize};

use crate::catalog::{EventPayload, EventType};
use crate::error::ValidationError;

/// Immutable wrapper around an event payload carrying identity and causal
/// metadata.
///
/// `event_type` is a plain string on the wire so that a malformed or
/// unknown message can still be inspected and dead-lettered; [`Self::kind`]
/// and [`Self::decode`] resolve it against the closed catalog.
///
/// Invariants: `event_id` is generated once and never reused; `key` is the
/// order id and is stable for all events of one order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Globally unique event identifier (the idempotency key).
    pub event_id: EventId,

    /// Namespaced, versioned type name, e.g. `order.OrderCreated.v1`.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Schema version (matches the suffix in the type name).
    pub version: u32,

    /// When the event was created.
    pub timestamp: DateTime<Utc>,

    /// Identifies the saga instance; defaults to the id of the root event.
    pub correlation_id: EventId,

    /// Id of the event that caused this one; absent for root events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<EventId>,

    /// Ordering/partitioning key — the order id.
    pub key: String,

    /// The payload, typed per `event_type`.
    pub payload: serde_json::Value,

    /// Open string-keyed scalar metadata.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl EventEnvelope {
    /// Starts building a new envelope.
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Resolves the wire type name against the catalog.
    pub fn kind(&self) -> Result<EventType, ValidationError> {
        self.event_type.parse()
    }

    /// Decodes and validates the payload against its registered schema.
    pub fn decode(&self) -> Result<EventPayload, ValidationError> {
        EventPayload::decode(self.kind()?, &self.payload)
    }

    /// Validates the envelope without keeping the decoded payload.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.decode().map(|_| ())
    }

    /// The topic this envelope belongs on.
    pub fn topic(&self) -> &str {
        &self.event_type
    }

    /// Builds a follow-up envelope caused by this one: same saga
    /// correlation, `causation_id` set to this event's id.
    pub fn follow(&self, payload: &EventPayload) -> Result<EventEnvelope, ValidationError> {
        let key = payload
            .order_id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| self.key.clone());
        EventEnvelope::builder()
            .payload(payload)?
            .key(key)
            .correlation_id(self.correlation_id)
            .causation_id(self.event_id)
            .build()
    }
}

/// Builder for constructing validated envelopes.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    payload: Option<(EventType, serde_json::Value)>,
    key: Option<String>,
    correlation_id: Option<EventId>,
    causation_id: Option<EventId>,
    headers: HashMap<String, String>,
}

impl EventEnvelopeBuilder {
    /// Sets the typed payload; the wire type name is derived from it and
    /// the payload is validated immediately.
    pub fn payload(mut self, payload: &EventPayload) -> Result<Self, ValidationError> {
        payload.validate()?;
        self.payload = Some((payload.event_type(), payload.to_value()?));
        Ok(self)
    }

    /// Sets the ordering key. If not set, the payload's order id is used.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Carries an existing saga correlation id. Root events leave this
    /// unset and default to their own event id.
    pub fn correlation_id(mut self, id: EventId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Links the envelope to the event that triggered it.
    pub fn causation_id(mut self, id: EventId) -> Self {
        self.causation_id = Some(id);
        self
    }

    /// Adds a metadata header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Stamps a fresh event id and timestamp and assembles the envelope.
    pub fn build(self) -> Result<EventEnvelope, ValidationError> {
        let (event_type, payload) = self.payload.ok_or_else(|| {
            ValidationError::invalid("<unset>", "envelope requires a payload")
        })?;
        let key = self
            .key
            .or_else(|| {
                payload
                    .get("orderId")
                    .and_then(|v| v.as_str())
                    .map(String::from)
            })
            .ok_or_else(|| {
                ValidationError::invalid(event_type.as_str(), "envelope requires a key")
            })?;

        let event_id = EventId::new();
        Ok(EventEnvelope {
            event_id,
            event_type: event_type.as_str().to_string(),
            version: event_type.schema_version(),
            timestamp: Utc::now(),
            correlation_id: self.correlation_id.unwrap_or(event_id),
            causation_id: self.causation_id,
            key,
            payload,
            headers: self.headers,
        })
    }
}
