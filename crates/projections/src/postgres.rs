//! PostgreSQL-backed projection store.

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use common::OrderId;
use events::OrderStatus;

use crate::error::Result;
use crate::projection::{OrderProjection, ProjectionStore, TimelineEntry};

/// Projection store persisted in the `order_projections` table.
#[derive(Clone)]
pub struct PostgresProjectionStore {
    pool: PgPool,
}

impl PostgresProjectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_projection(row: PgRow) -> Result<OrderProjection> {
        let status: String = row.try_get("current_status")?;
        let timeline: serde_json::Value = row.try_get("timeline")?;
        Ok(OrderProjection {
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            current_status: serde_json::from_value(serde_json::Value::String(status))?,
            timeline: serde_json::from_value(timeline)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl ProjectionStore for PostgresProjectionStore {
    async fn apply(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        entry: TimelineEntry,
    ) -> Result<OrderProjection> {
        let row = sqlx::query(
            r#"
            INSERT INTO order_projections (order_id, current_status, timeline, created_at, updated_at)
            VALUES ($1, $2, jsonb_build_array($3::jsonb), $4, $4)
            ON CONFLICT (order_id) DO UPDATE SET
                current_status = EXCLUDED.current_status,
                timeline = order_projections.timeline || $3::jsonb,
                updated_at = EXCLUDED.updated_at
            RETURNING order_id, current_status, timeline, created_at, updated_at
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(status.as_str())
        .bind(serde_json::to_value(&entry)?)
        .bind(entry.at)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_projection(row)
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<OrderProjection>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT order_id, current_status, timeline, created_at, updated_at
            FROM order_projections
            WHERE order_id = $1
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_projection).transpose()
    }

    async fn list(&self) -> Result<Vec<OrderProjection>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, current_status, timeline, created_at, updated_at
            FROM order_projections
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_projection).collect()
    }
}
