//! PostgreSQL-backed order store.

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use common::{EventId, OrderId};
use events::{EventEnvelope, OrderStatus};
use messaging::PostgresOutboxStore;

use crate::aggregate::{HistoryEntry, OrderAggregate, OrderStore};
use crate::error::{Result, SagaError};

/// Order store persisted in the `orders` table.
///
/// `create` inserts the row and stages the `OrderCreated` envelope in the
/// same transaction through the shared outbox table.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_order(row: PgRow) -> Result<OrderAggregate> {
        let items: serde_json::Value = row.try_get("items")?;
        let history: serde_json::Value = row.try_get("history")?;
        let status: String = row.try_get("status")?;
        Ok(OrderAggregate {
            id: OrderId::from_uuid(row.try_get::<Uuid, _>("id")?),
            items: serde_json::from_value(items)?,
            total: row.try_get("total")?,
            status: serde_json::from_value(serde_json::Value::String(status))?,
            history: serde_json::from_value(history)?,
            correlation_id: EventId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn create(
        &self,
        order: &OrderAggregate,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO orders (id, items, total, status, history, correlation_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(serde_json::to_value(&order.items)?)
        .bind(order.total)
        .bind(order.status.as_str())
        .bind(serde_json::to_value(&order.history)?)
        .bind(order.correlation_id.as_uuid())
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(SagaError::OrderAlreadyExists(order.id));
        }

        PostgresOutboxStore::enqueue_in_tx(&mut tx, topic, envelope).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn apply(&self, id: OrderId, status: OrderStatus, entry: HistoryEntry) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM orders WHERE id = $1 FOR UPDATE")
                .bind(id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;
        let current = current.ok_or(SagaError::OrderNotFound(id))?;
        let from: OrderStatus = serde_json::from_value(serde_json::Value::String(current))?;

        if !OrderAggregate::transition_allowed(from, status) {
            return Err(SagaError::InvalidTransition {
                order_id: id,
                from,
                to: status,
            });
        }

        sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, history = history || $3::jsonb, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(serde_json::to_value(&entry)?)
        .bind(entry.at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: OrderId) -> Result<Option<OrderAggregate>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT id, items, total, status, history, correlation_id, created_at, updated_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_order).transpose()
    }

    async fn list(&self) -> Result<Vec<OrderAggregate>> {
        let rows = sqlx::query(
            r#"
            SELECT id, items, total, status, history, correlation_id, created_at, updated_at
            FROM orders
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_order).collect()
    }
}
