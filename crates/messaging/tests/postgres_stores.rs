//! PostgreSQL integration tests for the outbox and processed-event stores.
//!
//! These tests share one PostgreSQL container. Run with:
//!
//! ```bash
//! cargo test -p messaging --test postgres_stores
//! ```

use std::sync::Arc;

use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

use common::OrderId;
use events::{EventEnvelope, EventPayload, OrderCreated, OrderItem};
use messaging::{
    OutboxStore, PostgresOutboxStore, PostgresProcessedStore, ProcessedStore, run_migrations,
};

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            run_migrations(&temp_pool).await.unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh pool with cleared tables for test isolation
async fn get_test_pool() -> PgPool {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE outbox, processed_events, orders, order_projections")
        .execute(&pool)
        .await
        .unwrap();

    pool
}

fn order_created_envelope() -> EventEnvelope {
    let payload = EventPayload::OrderCreated(OrderCreated {
        order_id: OrderId::new(),
        items: vec![OrderItem {
            sku: "SKU-001".to_string(),
            qty: 1,
        }],
        total: 1500,
    });
    EventEnvelope::builder()
        .payload(&payload)
        .unwrap()
        .build()
        .unwrap()
}

#[tokio::test]
#[serial]
async fn enqueue_then_pending_round_trip() {
    let pool = get_test_pool().await;
    let outbox = PostgresOutboxStore::new(pool);
    let envelope = order_created_envelope();

    let inserted = outbox
        .enqueue(envelope.topic(), &envelope)
        .await
        .unwrap();
    assert!(inserted);

    let pending = outbox.pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event_id, envelope.event_id);
    assert_eq!(pending[0].topic, "order.OrderCreated.v1");
    assert!(pending[0].sent_at.is_none());
}

#[tokio::test]
#[serial]
async fn enqueue_is_idempotent_per_event_id() {
    let pool = get_test_pool().await;
    let outbox = PostgresOutboxStore::new(pool);
    let envelope = order_created_envelope();

    assert!(outbox.enqueue(envelope.topic(), &envelope).await.unwrap());
    assert!(!outbox.enqueue(envelope.topic(), &envelope).await.unwrap());

    let pending = outbox.pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
#[serial]
async fn mark_sent_removes_from_pending_but_keeps_the_record() {
    let pool = get_test_pool().await;
    let outbox = PostgresOutboxStore::new(pool);
    let envelope = order_created_envelope();

    outbox.enqueue(envelope.topic(), &envelope).await.unwrap();
    outbox.mark_sent(envelope.event_id).await.unwrap();

    assert!(outbox.pending(10).await.unwrap().is_empty());

    let record = outbox.get(envelope.event_id).await.unwrap().unwrap();
    assert!(record.sent_at.is_some());
}

#[tokio::test]
#[serial]
async fn mark_failed_counts_attempts_and_keeps_pending() {
    let pool = get_test_pool().await;
    let outbox = PostgresOutboxStore::new(pool);
    let envelope = order_created_envelope();

    outbox.enqueue(envelope.topic(), &envelope).await.unwrap();
    outbox
        .mark_failed(envelope.event_id, "broker unavailable")
        .await
        .unwrap();
    outbox
        .mark_failed(envelope.event_id, "broker unavailable")
        .await
        .unwrap();

    let pending = outbox.pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 2);
    assert_eq!(pending[0].last_error.as_deref(), Some("broker unavailable"));
}

#[tokio::test]
#[serial]
async fn pending_respects_the_batch_limit() {
    let pool = get_test_pool().await;
    let outbox = PostgresOutboxStore::new(pool);

    for _ in 0..5 {
        let envelope = order_created_envelope();
        outbox.enqueue(envelope.topic(), &envelope).await.unwrap();
    }

    assert_eq!(outbox.pending(3).await.unwrap().len(), 3);
    assert_eq!(outbox.pending(10).await.unwrap().len(), 5);
}

#[tokio::test]
#[serial]
async fn processed_markers_insert_once_and_can_be_released() {
    let pool = get_test_pool().await;
    let store = PostgresProcessedStore::new(pool);
    let envelope = order_created_envelope();

    assert!(
        store
            .insert("inventory-service", envelope.event_id)
            .await
            .unwrap()
    );
    assert!(
        !store
            .insert("inventory-service", envelope.event_id)
            .await
            .unwrap()
    );

    // A different consumer has its own marker space.
    assert!(
        store
            .insert("payment-service", envelope.event_id)
            .await
            .unwrap()
    );

    store
        .remove("inventory-service", envelope.event_id)
        .await
        .unwrap();
    assert!(
        store
            .insert("inventory-service", envelope.event_id)
            .await
            .unwrap()
    );
}
