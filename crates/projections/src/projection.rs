//! The per-order read model and its storage.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::OrderId;
use events::OrderStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;

/// One projected event on an order's timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub event_type: String,
    pub at: DateTime<Utc>,
    /// The event payload as it appeared on the wire.
    pub details: serde_json::Value,
}

/// Denormalized view of one order: where it is now and how it got there.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderProjection {
    pub order_id: OrderId,
    pub current_status: OrderStatus,
    pub timeline: Vec<TimelineEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Storage for order projections.
///
/// `apply` is an upsert: the first event for an order creates the row,
/// later ones overwrite the status and append to the timeline. The read
/// model trusts event order as delivered and keeps no transition rules of
/// its own.
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Folds one event into the projection and returns the updated view.
    async fn apply(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        entry: TimelineEntry,
    ) -> Result<OrderProjection>;

    async fn get(&self, order_id: OrderId) -> Result<Option<OrderProjection>>;

    async fn list(&self) -> Result<Vec<OrderProjection>>;
}

/// In-memory projection store for tests and local wiring.
#[derive(Clone, Default)]
pub struct InMemoryProjectionStore {
    projections: Arc<RwLock<HashMap<OrderId, OrderProjection>>>,
}

impl InMemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn projection_count(&self) -> usize {
        self.projections.read().await.len()
    }
}

#[async_trait]
impl ProjectionStore for InMemoryProjectionStore {
    async fn apply(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        entry: TimelineEntry,
    ) -> Result<OrderProjection> {
        let mut projections = self.projections.write().await;
        let projection = projections.entry(order_id).or_insert_with(|| OrderProjection {
            order_id,
            current_status: status,
            timeline: Vec::new(),
            created_at: entry.at,
            updated_at: entry.at,
        });
        projection.current_status = status;
        projection.updated_at = entry.at;
        projection.timeline.push(entry);
        Ok(projection.clone())
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<OrderProjection>> {
        Ok(self.projections.read().await.get(&order_id).cloned())
    }

    async fn list(&self) -> Result<Vec<OrderProjection>> {
        let mut all: Vec<_> = self.projections.read().await.values().cloned().collect();
        all.sort_by_key(|p| p.created_at);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(event_type: &str) -> TimelineEntry {
        TimelineEntry {
            event_type: event_type.to_string(),
            at: Utc::now(),
            details: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn first_event_creates_the_projection() {
        let store = InMemoryProjectionStore::new();
        let order_id = OrderId::new();

        let projection = store
            .apply(order_id, OrderStatus::Created, entry("order.OrderCreated.v1"))
            .await
            .unwrap();

        assert_eq!(projection.current_status, OrderStatus::Created);
        assert_eq!(projection.timeline.len(), 1);
        assert_eq!(projection.created_at, projection.updated_at);
    }

    #[tokio::test]
    async fn later_events_append_and_keep_created_at() {
        let store = InMemoryProjectionStore::new();
        let order_id = OrderId::new();

        let first = store
            .apply(order_id, OrderStatus::Created, entry("order.OrderCreated.v1"))
            .await
            .unwrap();
        let second = store
            .apply(
                order_id,
                OrderStatus::InventoryReserved,
                entry("inventory.InventoryReserved.v1"),
            )
            .await
            .unwrap();

        assert_eq!(second.current_status, OrderStatus::InventoryReserved);
        assert_eq!(second.timeline.len(), 2);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn list_orders_by_creation_time() {
        let store = InMemoryProjectionStore::new();
        let first = OrderId::new();
        let second = OrderId::new();

        store
            .apply(first, OrderStatus::Created, entry("order.OrderCreated.v1"))
            .await
            .unwrap();
        store
            .apply(second, OrderStatus::Created, entry("order.OrderCreated.v1"))
            .await
            .unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].order_id, first);
    }
}
