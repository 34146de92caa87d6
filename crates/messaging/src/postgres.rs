//! PostgreSQL-backed outbox and processed-event stores.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use common::EventId;
use events::EventEnvelope;

use crate::error::Result;
use crate::idempotency::ProcessedStore;
use crate::outbox::{OutboxRecord, OutboxStore};

/// Runs the database migrations.
pub async fn run_migrations(pool: &PgPool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}

/// Outbox store persisted in the `outbox` table.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Stages an envelope inside a caller-owned transaction, so the
    /// staging commits or rolls back together with the state change it
    /// belongs to. Returns `false` when the event id was already staged.
    pub async fn enqueue_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Result<bool> {
        envelope.validate()?;
        let result = sqlx::query(
            r#"
            INSERT INTO outbox (event_id, topic, envelope, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(envelope.event_id.as_uuid())
        .bind(topic)
        .bind(serde_json::to_value(envelope)?)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    fn row_to_record(row: PgRow) -> Result<OutboxRecord> {
        let envelope: serde_json::Value = row.try_get("envelope")?;
        Ok(OutboxRecord {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            topic: row.try_get("topic")?,
            envelope: serde_json::from_value(envelope)?,
            sent_at: row.try_get("sent_at")?,
            attempts: row.try_get::<i32, _>("attempts")? as u32,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn enqueue(&self, topic: &str, envelope: &EventEnvelope) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let staged = Self::enqueue_in_tx(&mut tx, topic, envelope).await?;
        tx.commit().await?;
        Ok(staged)
    }

    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, topic, envelope, sent_at, attempts, last_error, created_at, updated_at
            FROM outbox
            WHERE sent_at IS NULL
            ORDER BY created_at ASC, event_id ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn mark_sent(&self, event_id: EventId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET sent_at = NOW(), updated_at = NOW()
            WHERE event_id = $1 AND sent_at IS NULL
            "#,
        )
        .bind(event_id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_failed(&self, event_id: EventId, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET attempts = attempts + 1, last_error = $2, updated_at = NOW()
            WHERE event_id = $1 AND sent_at IS NULL
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, event_id: EventId) -> Result<Option<OutboxRecord>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT event_id, topic, envelope, sent_at, attempts, last_error, created_at, updated_at
            FROM outbox
            WHERE event_id = $1
            "#,
        )
        .bind(event_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }
}

/// Processed-event markers persisted in the `processed_events` table.
///
/// The composite primary key makes `insert` a race-safe claim: of two
/// concurrent deliveries, exactly one insert reports a new row.
#[derive(Clone)]
pub struct PostgresProcessedStore {
    pool: PgPool,
}

impl PostgresProcessedStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessedStore for PostgresProcessedStore {
    async fn insert(&self, consumer: &str, event_id: EventId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (consumer, event_id, processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (consumer, event_id) DO NOTHING
            "#,
        )
        .bind(consumer)
        .bind(event_id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn remove(&self, consumer: &str, event_id: EventId) -> Result<()> {
        sqlx::query("DELETE FROM processed_events WHERE consumer = $1 AND event_id = $2")
            .bind(consumer)
            .bind(event_id.as_uuid())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
