//! Dead-letter routing for deliveries that cannot be processed.

use std::sync::Arc;

use events::{DeadLetter, EventEnvelope, EventPayload};

use crate::error::{MessagingError, Result};
use crate::outbox::OutboxStore;

/// Dead-letter topic for a given source topic.
pub fn dlq_topic(topic: &str) -> String {
    format!("{topic}.dlq")
}

/// Stages `ops.DeadLetter.v1` events through the outbox so dead letters
/// get the same delivery guarantees as everything else.
///
/// A routed delivery is terminal for the consumer: the loop moves on and
/// the original event is only reprocessed through an explicit retry.
pub struct DeadLetterRouter {
    outbox: Arc<dyn OutboxStore>,
}

impl DeadLetterRouter {
    pub fn new(outbox: Arc<dyn OutboxStore>) -> Self {
        Self { outbox }
    }

    /// Routes a decoded envelope whose handling failed.
    pub async fn route(&self, envelope: &EventEnvelope, error: &str) -> Result<()> {
        let dead = EventPayload::DeadLetter(DeadLetter {
            original_type: envelope.event_type.clone(),
            original_event_id: envelope.event_id.to_string(),
            order_id: envelope
                .decode()
                .ok()
                .and_then(|payload| payload.order_id())
                .map(|id| id.to_string()),
            error: error.to_string(),
            payload: envelope.payload.clone(),
        });
        let dlq = EventEnvelope::builder()
            .payload(&dead)
            .map_err(stage_error)?
            .key(envelope.key.clone())
            .correlation_id(envelope.correlation_id)
            .causation_id(envelope.event_id)
            .build()
            .map_err(stage_error)?;

        self.stage(&dlq_topic(envelope.topic()), &dlq).await
    }

    /// Routes a delivery whose bytes never decoded into an envelope. The
    /// delivery key is carried over so the dead letter stays on the same
    /// partition as its source.
    pub async fn route_raw(&self, topic: &str, key: &str, raw: &[u8], error: &str) -> Result<()> {
        let payload = serde_json::from_slice::<serde_json::Value>(raw)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(raw).into()));
        let original_type = payload
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let original_event_id = payload
            .get("eventId")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        let dead = EventPayload::DeadLetter(DeadLetter {
            original_type,
            original_event_id,
            order_id: None,
            error: error.to_string(),
            payload,
        });
        let dlq = EventEnvelope::builder()
            .payload(&dead)
            .map_err(stage_error)?
            .key(key)
            .build()
            .map_err(stage_error)?;

        self.stage(&dlq_topic(topic), &dlq).await
    }

    async fn stage(&self, topic: &str, dlq: &EventEnvelope) -> Result<()> {
        self.outbox
            .enqueue(topic, dlq)
            .await
            .map_err(|err| MessagingError::DeadLetterStaging(Box::new(err)))?;
        metrics::counter!("dead_letters_total", "topic" => topic.to_string()).increment(1);
        tracing::warn!(topic = %topic, event_id = %dlq.event_id, "event routed to dead letter queue");
        Ok(())
    }
}

fn stage_error(err: events::ValidationError) -> MessagingError {
    MessagingError::DeadLetterStaging(Box::new(MessagingError::Validation(err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::InMemoryOutboxStore;
    use common::OrderId;
    use events::{EventType, OrderCreated, OrderItem};

    fn order_envelope() -> EventEnvelope {
        let payload = EventPayload::OrderCreated(OrderCreated {
            order_id: OrderId::new(),
            items: vec![OrderItem {
                sku: "SKU-1".into(),
                qty: 1,
            }],
            total: 10,
        });
        EventEnvelope::builder()
            .payload(&payload)
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn dlq_topic_appends_suffix() {
        assert_eq!(dlq_topic("order.OrderCreated.v1"), "order.OrderCreated.v1.dlq");
    }

    #[tokio::test]
    async fn routed_envelope_lands_on_dlq_topic() {
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let router = DeadLetterRouter::new(outbox.clone());

        let envelope = order_envelope();
        router.route(&envelope, "boom").await.unwrap();

        let pending = outbox.pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].topic, "order.OrderCreated.v1.dlq");
        assert_eq!(pending[0].envelope.kind().unwrap(), EventType::DeadLetter);

        let EventPayload::DeadLetter(dead) = pending[0].envelope.decode().unwrap() else {
            panic!("expected dead letter payload");
        };
        assert_eq!(dead.original_type, "order.OrderCreated.v1");
        assert_eq!(dead.original_event_id, envelope.event_id.to_string());
        assert_eq!(dead.error, "boom");
        assert!(dead.order_id.is_some());
    }

    #[tokio::test]
    async fn dead_letter_keeps_original_correlation() {
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let router = DeadLetterRouter::new(outbox.clone());

        let envelope = order_envelope();
        router.route(&envelope, "boom").await.unwrap();

        let pending = outbox.pending(10).await.unwrap();
        assert_eq!(pending[0].envelope.correlation_id, envelope.correlation_id);
        assert_eq!(pending[0].envelope.causation_id, Some(envelope.event_id));
        assert_eq!(pending[0].envelope.key, envelope.key);
    }

    #[tokio::test]
    async fn undecodable_bytes_are_preserved() {
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let router = DeadLetterRouter::new(outbox.clone());

        router
            .route_raw("order.OrderCreated.v1", "k1", b"not json at all", "parse error")
            .await
            .unwrap();

        let pending = outbox.pending(10).await.unwrap();
        assert_eq!(pending[0].topic, "order.OrderCreated.v1.dlq");
        assert_eq!(pending[0].envelope.key, "k1");
        let EventPayload::DeadLetter(dead) = pending[0].envelope.decode().unwrap() else {
            panic!("expected dead letter payload");
        };
        assert_eq!(dead.original_type, "unknown");
        assert_eq!(
            dead.payload,
            serde_json::Value::String("not json at all".into())
        );
    }
}
