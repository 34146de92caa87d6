//! Consumer loop wiring a handler to the broker with idempotent
//! consumption and dead-letter routing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use events::EventEnvelope;

use crate::broker::{Broker, Delivery};
use crate::dead_letter::DeadLetterRouter;
use crate::error::{BoxError, MessagingError, Result};
use crate::idempotency::{with_idempotency, ProcessedStore};

/// A service's reaction to one event.
///
/// Handlers receive only decodable, schema-valid envelopes; anything
/// else is dead-lettered before it reaches them. A returned error
/// dead-letters the event and releases its idempotency marker so an
/// operator retry can reprocess it.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Consumer name, used as the idempotency scope and the broker group.
    fn name(&self) -> &str;

    /// Topics this handler subscribes to.
    fn topics(&self) -> Vec<&'static str>;

    async fn handle(&self, envelope: &EventEnvelope) -> std::result::Result<(), BoxError>;
}

/// Drives one handler from its broker subscription.
pub struct ConsumerLoop {
    broker: Arc<dyn Broker>,
    processed: Arc<dyn ProcessedStore>,
    dead_letters: DeadLetterRouter,
    handler: Arc<dyn EventHandler>,
}

impl ConsumerLoop {
    pub fn new(
        broker: Arc<dyn Broker>,
        processed: Arc<dyn ProcessedStore>,
        dead_letters: DeadLetterRouter,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            broker,
            processed,
            dead_letters,
            handler,
        }
    }

    pub fn name(&self) -> &str {
        self.handler.name()
    }

    /// Processes one delivery end to end: decode, validate, dedup, handle.
    ///
    /// Returns an error only when the messaging layer itself fails
    /// (store or dead-letter staging); handler errors are absorbed into
    /// the dead-letter queue.
    pub async fn process(&self, delivery: &Delivery) -> Result<()> {
        let consumer = self.handler.name();

        let envelope: EventEnvelope = match serde_json::from_slice(&delivery.value) {
            Ok(envelope) => envelope,
            Err(err) => {
                return self
                    .dead_letters
                    .route_raw(&delivery.topic, &delivery.key, &delivery.value, &err.to_string())
                    .await;
            }
        };
        if let Err(err) = envelope.validate() {
            return self.dead_letters.route(&envelope, &err.to_string()).await;
        }

        let outcome = with_idempotency::<_, _, _, _, BoxError>(
            self.processed.as_ref(),
            consumer,
            envelope.event_id,
            || self.handler.handle(&envelope),
        )
        .await;

        match outcome {
            Ok(outcome) if outcome.already_processed() => {
                metrics::counter!("events_deduplicated_total", "consumer" => consumer.to_string())
                    .increment(1);
                tracing::debug!(
                    consumer = %consumer,
                    event_id = %envelope.event_id,
                    "duplicate delivery skipped"
                );
                Ok(())
            }
            Ok(_) => {
                metrics::counter!("events_processed_total", "consumer" => consumer.to_string())
                    .increment(1);
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    consumer = %consumer,
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    error = %err,
                    "handler failed, routing to dead letter queue"
                );
                self.dead_letters.route(&envelope, &err.to_string()).await
            }
        }
    }

    /// Subscribes and processes deliveries until the shutdown signal
    /// fires. Store errors are logged and the loop keeps going; a failed
    /// dead-letter staging halts the consumer, because moving past it
    /// would silently drop the poison message.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let topics = self.handler.topics();
        let mut subscription = self.broker.subscribe(self.handler.name(), &topics).await?;
        tracing::info!(consumer = %self.handler.name(), ?topics, "consumer started");

        loop {
            tokio::select! {
                delivery = subscription.recv() => {
                    let Some(delivery) = delivery else { break };
                    if let Err(err) = self.process(&delivery).await {
                        if matches!(err, MessagingError::DeadLetterStaging(_)) {
                            tracing::error!(
                                consumer = %self.handler.name(),
                                error = %err,
                                "dead letter staging failed, stopping consumer"
                            );
                            return Err(err);
                        }
                        tracing::error!(
                            consumer = %self.handler.name(),
                            error = %err,
                            "delivery processing failed"
                        );
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!(consumer = %self.handler.name(), "consumer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::idempotency::InMemoryProcessedStore;
    use crate::outbox::{InMemoryOutboxStore, OutboxRecord, OutboxStore};
    use common::{EventId, OrderId};
    use events::{EventPayload, OrderCreated, OrderItem};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    /// Outbox whose staging always fails, as if the database were down.
    struct BrokenOutbox;

    #[async_trait]
    impl OutboxStore for BrokenOutbox {
        async fn enqueue(&self, _topic: &str, _envelope: &EventEnvelope) -> Result<bool> {
            Err(MessagingError::Broker("outbox unavailable".to_string()))
        }

        async fn pending(&self, _limit: usize) -> Result<Vec<OutboxRecord>> {
            Ok(Vec::new())
        }

        async fn mark_sent(&self, _event_id: EventId) -> Result<()> {
            Ok(())
        }

        async fn mark_failed(&self, _event_id: EventId, _error: &str) -> Result<()> {
            Ok(())
        }

        async fn get(&self, _event_id: EventId) -> Result<Option<OutboxRecord>> {
            Ok(None)
        }
    }

    struct CountingHandler {
        calls: AtomicU32,
        fail: AtomicBool,
    }

    impl CountingHandler {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        fn name(&self) -> &str {
            "counting-service"
        }

        fn topics(&self) -> Vec<&'static str> {
            vec!["order.OrderCreated.v1"]
        }

        async fn handle(&self, _envelope: &EventEnvelope) -> std::result::Result<(), BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err("simulated handler failure".into());
            }
            Ok(())
        }
    }

    fn envelope() -> EventEnvelope {
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

    fn delivery_for(envelope: &EventEnvelope) -> Delivery {
        Delivery {
            topic: envelope.topic().to_string(),
            key: envelope.key.clone(),
            value: serde_json::to_vec(envelope).unwrap(),
        }
    }

    fn consumer_with(
        handler: Arc<CountingHandler>,
        outbox: Arc<InMemoryOutboxStore>,
    ) -> ConsumerLoop {
        ConsumerLoop::new(
            Arc::new(InMemoryBroker::new()),
            Arc::new(InMemoryProcessedStore::new()),
            DeadLetterRouter::new(outbox),
            handler,
        )
    }

    #[tokio::test]
    async fn duplicate_delivery_runs_handler_once() {
        let handler = Arc::new(CountingHandler::new());
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let consumer = consumer_with(handler.clone(), outbox);

        let delivery = delivery_for(&envelope());
        consumer.process(&delivery).await.unwrap();
        consumer.process(&delivery).await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_failure_dead_letters_and_releases_marker() {
        let handler = Arc::new(CountingHandler::new());
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let consumer = consumer_with(handler.clone(), outbox.clone());

        handler.fail.store(true, Ordering::SeqCst);
        let delivery = delivery_for(&envelope());
        consumer.process(&delivery).await.unwrap();

        let pending = outbox.pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].topic, "order.OrderCreated.v1.dlq");

        // Marker was rolled back, so a redelivery reaches the handler.
        handler.fail.store(false, Ordering::SeqCst);
        consumer.process(&delivery).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unparseable_delivery_is_dead_lettered() {
        let handler = Arc::new(CountingHandler::new());
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let consumer = consumer_with(handler.clone(), outbox.clone());

        let delivery = Delivery {
            topic: "order.OrderCreated.v1".to_string(),
            key: "k".to_string(),
            value: b"{broken".to_vec(),
        };
        consumer.process(&delivery).await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        let pending = outbox.pending(10).await.unwrap();
        assert_eq!(pending[0].topic, "order.OrderCreated.v1.dlq");
    }

    #[tokio::test]
    async fn invalid_payload_never_reaches_handler() {
        let handler = Arc::new(CountingHandler::new());
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let consumer = consumer_with(handler.clone(), outbox.clone());

        // Structurally sound envelope, but qty 0 violates the schema.
        let mut envelope = envelope();
        envelope.payload["items"][0]["qty"] = serde_json::json!(0);
        let delivery = delivery_for(&envelope);
        consumer.process(&delivery).await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        let pending = outbox.pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn run_consumes_from_subscription() {
        let handler = Arc::new(CountingHandler::new());
        let broker = Arc::new(InMemoryBroker::new());
        let consumer = ConsumerLoop::new(
            broker.clone(),
            Arc::new(InMemoryProcessedStore::new()),
            DeadLetterRouter::new(Arc::new(InMemoryOutboxStore::new())),
            handler.clone(),
        );

        let envelope = envelope();
        broker
            .publish(
                envelope.topic(),
                &envelope.key,
                serde_json::to_vec(&envelope).unwrap(),
            )
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let join = tokio::spawn(async move { consumer.run(rx).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        join.await.unwrap().unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_halts_when_dead_letter_staging_fails() {
        let handler = Arc::new(CountingHandler::new());
        handler.fail.store(true, Ordering::SeqCst);
        let broker = Arc::new(InMemoryBroker::new());
        let consumer = ConsumerLoop::new(
            broker.clone(),
            Arc::new(InMemoryProcessedStore::new()),
            DeadLetterRouter::new(Arc::new(BrokenOutbox)),
            handler.clone(),
        );

        // Two poison messages: the loop must stop at the first one whose
        // dead letter cannot be staged instead of sailing past it.
        for _ in 0..2 {
            let envelope = envelope();
            broker
                .publish(
                    envelope.topic(),
                    &envelope.key,
                    serde_json::to_vec(&envelope).unwrap(),
                )
                .await
                .unwrap();
        }

        let (_tx, rx) = watch::channel(false);
        let outcome = tokio::time::timeout(Duration::from_secs(1), consumer.run(rx))
            .await
            .expect("run should return, not wait for shutdown");

        assert!(matches!(outcome, Err(MessagingError::DeadLetterStaging(_))));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
