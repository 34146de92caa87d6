//! Background outbox dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::broker::Broker;
use crate::error::Result;
use crate::outbox::OutboxStore;

const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_BATCH_SIZE: usize = 50;

/// Drains pending outbox records to the broker on a fixed interval.
///
/// The dispatcher runs independently of the consumer loop; the two share
/// only the durable store. Publish failures are recorded on the record
/// and retried on the next tick, indefinitely — the outbox never gives
/// up on a record.
pub struct OutboxDispatcher {
    outbox: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    interval: Duration,
    batch_size: usize,
}

impl OutboxDispatcher {
    /// Creates a dispatcher with the default interval and batch size.
    pub fn new(outbox: Arc<dyn OutboxStore>, broker: Arc<dyn Broker>) -> Self {
        Self {
            outbox,
            broker,
            interval: DEFAULT_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Sets the tick interval.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the maximum number of records drained per tick.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Drains one batch of pending records, oldest first. Returns the
    /// number of records successfully published.
    pub async fn drain_once(&self) -> Result<usize> {
        let pending = self.outbox.pending(self.batch_size).await?;
        let mut published = 0;

        for record in pending {
            let bytes = serde_json::to_vec(&record.envelope)?;
            match self
                .broker
                .publish(&record.topic, &record.envelope.key, bytes)
                .await
            {
                Ok(()) => {
                    self.outbox.mark_sent(record.event_id).await?;
                    metrics::counter!("outbox_published_total").increment(1);
                    published += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        topic = %record.topic,
                        event_id = %record.event_id,
                        attempts = record.attempts + 1,
                        error = %err,
                        "outbox publish failed, will retry"
                    );
                    self.outbox
                        .mark_failed(record.event_id, &err.to_string())
                        .await?;
                    metrics::counter!("outbox_publish_failures_total").increment(1);
                }
            }
        }

        Ok(published)
    }

    /// Runs the dispatcher until the shutdown signal fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.drain_once().await {
                        tracing::error!(error = %err, "outbox drain failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("outbox dispatcher stopped");
    }
}
