//! HTTP surface and process wiring for the order fulfillment saga.
//!
//! [`Pipeline`] assembles the messaging fabric (broker, outbox
//! dispatcher, consumer loops) together with every saga participant and
//! the read-model projector, backed either by in-memory stores or by
//! PostgreSQL. [`create_app`] builds the axum router over the shared
//! [`AppState`].

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use messaging::{
    Broker, ConsumerLoop, DeadLetterRouter, InMemoryBroker, InMemoryOutboxStore,
    InMemoryProcessedStore, OutboxDispatcher, OutboxStore, PostgresOutboxStore,
    PostgresProcessedStore, ProcessedStore,
};
use projections::{
    InMemoryProjectionStore, PostgresProjectionStore, ProjectionStore, Projector, SubscriptionHub,
};
use saga::{
    InMemoryOrderStore, InventoryHandler, OrderHandler, OrderService, PostgresOrderStore,
    PaymentHandler, ShippingHandler, SimulatedInventory, SimulatedPayments, SimulatedShipping,
};

pub use config::Config;
pub use error::ApiError;

/// Shared state handed to every route handler.
pub struct AppState {
    pub order_service: OrderService,
    pub projections: Arc<dyn ProjectionStore>,
    pub hub: Arc<SubscriptionHub>,
}

/// The fully wired event pipeline: one broker, one outbox dispatcher,
/// and a consumer loop per saga participant plus the projector.
pub struct Pipeline {
    state: Arc<AppState>,
    dispatcher: OutboxDispatcher,
    consumers: Vec<ConsumerLoop>,
}

impl Pipeline {
    /// Wires every participant against in-memory stores. Used for local
    /// runs without a database and throughout the integration tests.
    pub fn in_memory(config: &Config) -> Self {
        let outbox: Arc<dyn OutboxStore> = Arc::new(InMemoryOutboxStore::new());
        let processed: Arc<dyn ProcessedStore> = Arc::new(InMemoryProcessedStore::new());
        let order_store = Arc::new(InMemoryOrderStore::new(outbox.clone()));
        let projection_store: Arc<dyn ProjectionStore> = Arc::new(InMemoryProjectionStore::new());
        Self::assemble(config, outbox, processed, order_store, projection_store)
    }

    /// Wires every participant against PostgreSQL-backed stores.
    pub fn postgres(pool: PgPool, config: &Config) -> Self {
        let outbox: Arc<dyn OutboxStore> = Arc::new(PostgresOutboxStore::new(pool.clone()));
        let processed: Arc<dyn ProcessedStore> = Arc::new(PostgresProcessedStore::new(pool.clone()));
        let order_store = Arc::new(PostgresOrderStore::new(pool.clone()));
        let projection_store: Arc<dyn ProjectionStore> =
            Arc::new(PostgresProjectionStore::new(pool));
        Self::assemble(config, outbox, processed, order_store, projection_store)
    }

    fn assemble(
        config: &Config,
        outbox: Arc<dyn OutboxStore>,
        processed: Arc<dyn ProcessedStore>,
        order_store: Arc<dyn saga::OrderStore>,
        projection_store: Arc<dyn ProjectionStore>,
    ) -> Self {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let hub = Arc::new(SubscriptionHub::new());

        let order_service = OrderService::new(order_store.clone(), outbox.clone());

        let handlers: Vec<Arc<dyn messaging::EventHandler>> = vec![
            Arc::new(OrderHandler::new(order_store)),
            Arc::new(InventoryHandler::new(
                Arc::new(SimulatedInventory::new()),
                outbox.clone(),
            )),
            Arc::new(PaymentHandler::new(
                Arc::new(SimulatedPayments::new()),
                outbox.clone(),
            )),
            Arc::new(ShippingHandler::new(
                Arc::new(SimulatedShipping::new()),
                outbox.clone(),
            )),
            Arc::new(Projector::new(projection_store.clone(), hub.clone())),
        ];

        let consumers = handlers
            .into_iter()
            .map(|handler| {
                ConsumerLoop::new(
                    broker.clone(),
                    processed.clone(),
                    DeadLetterRouter::new(outbox.clone()),
                    handler,
                )
            })
            .collect();

        let dispatcher = OutboxDispatcher::new(outbox, broker)
            .interval(config.outbox_interval)
            .batch_size(config.outbox_batch_size);

        Self {
            state: Arc::new(AppState {
                order_service,
                projections: projection_store,
                hub,
            }),
            dispatcher,
            consumers,
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Spawns the dispatcher and every consumer loop onto the runtime.
    pub fn start(self) -> PipelineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.consumers.len() + 1);

        let dispatcher = self.dispatcher;
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            dispatcher.run(rx).await;
        }));

        for consumer in self.consumers {
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(error) = consumer.run(rx).await {
                    tracing::error!(consumer = consumer.name(), %error, "consumer loop stopped");
                }
            }));
        }

        PipelineHandle { shutdown_tx, tasks }
    }
}

/// Handle over the running pipeline tasks; signals shutdown and waits
/// for each one to drain.
pub struct PipelineHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Builds the router: order endpoints, projections, live streams,
/// operator commands, plus health and Prometheus metrics.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders", post(routes::orders::create))
        .route("/orders", get(routes::orders::list))
        .route("/orders/{id}", get(routes::orders::get))
        .route("/orders/{id}/projection", get(routes::orders::projection))
        .route("/orders/{id}/stream", get(routes::orders::stream))
        .route("/admin/orders/{id}/retry", post(routes::admin::retry))
        .route(
            "/admin/orders/{id}/compensate",
            post(routes::admin::compensate),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
