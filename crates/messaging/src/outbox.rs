//! Transactional outbox staging.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EventId;
use events::EventEnvelope;
use tokio::sync::RwLock;

use crate::error::Result;

/// One staged event awaiting publication.
///
/// A record with `sent_at` absent is pending; once set it is never
/// cleared, and records are never deleted by the core (retention is an
/// external concern). `attempts`/`last_error` are the observability
/// signal for publish trouble — they never cause the record to be
/// dropped.
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub event_id: EventId,
    pub topic: String,
    pub envelope: EventEnvelope,
    pub sent_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable staging table for outgoing events, written alongside the
/// business-state change that produced them.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Validates and stages an envelope. A duplicate `event_id` is a
    /// no-op; returns whether a new record was inserted. Invalid
    /// envelopes fail fast here and are never placed on the wire.
    async fn enqueue(&self, topic: &str, envelope: &EventEnvelope) -> Result<bool>;

    /// Returns up to `limit` pending records, oldest first.
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// Marks a record as published.
    async fn mark_sent(&self, event_id: EventId) -> Result<()>;

    /// Records a publish failure; the record stays pending for the next
    /// dispatcher tick.
    async fn mark_failed(&self, event_id: EventId, error: &str) -> Result<()>;

    /// Looks a record up by event id.
    async fn get(&self, event_id: EventId) -> Result<Option<OutboxRecord>>;
}

/// In-memory outbox for tests and single-process wiring.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    records: Arc<RwLock<Vec<OutboxRecord>>>,
}

impl InMemoryOutboxStore {
    /// Creates a new empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records still pending publication.
    pub async fn pending_count(&self) -> usize {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.sent_at.is_none())
            .count()
    }

    /// Total number of staged records, sent or not.
    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(&self, topic: &str, envelope: &EventEnvelope) -> Result<bool> {
        envelope.validate()?;

        let mut records = self.records.write().await;
        if records.iter().any(|r| r.event_id == envelope.event_id) {
            return Ok(false);
        }

        let now = Utc::now();
        records.push(OutboxRecord {
            event_id: envelope.event_id,
            topic: topic.to_string(),
            envelope: envelope.clone(),
            sent_at: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        });
        Ok(true)
    }

    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.sent_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_sent(&self, event_id: EventId) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records.iter_mut().find(|r| r.event_id == event_id)
            && record.sent_at.is_none()
        {
            let now = Utc::now();
            record.sent_at = Some(now);
            record.updated_at = now;
        }
        Ok(())
    }

    async fn mark_failed(&self, event_id: EventId, error: &str) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records.iter_mut().find(|r| r.event_id == event_id) {
            record.attempts += 1;
            record.last_error = Some(error.to_string());
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get(&self, event_id: EventId) -> Result<Option<OutboxRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .find(|r| r.event_id == event_id)
            .cloned())
    }
}
