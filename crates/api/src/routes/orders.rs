//! Order endpoints: write side, read model, and live update streams.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use common::OrderId;
use events::{OrderItem, OrderStatus};
use projections::{OrderProjection, OrderUpdate};
use saga::OrderAggregate;

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub items: Vec<OrderItemRequest>,
    /// Order total in minor currency units.
    pub total: i64,
}

#[derive(Deserialize)]
pub struct OrderItemRequest {
    pub sku: String,
    pub qty: u32,
}

// -- Response types --

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdateResponse {
    pub order_id: OrderId,
    pub event_type: String,
    pub status: OrderStatus,
    pub at: DateTime<Utc>,
    pub details: serde_json::Value,
}

impl From<OrderUpdate> for OrderUpdateResponse {
    fn from(update: OrderUpdate) -> Self {
        Self {
            order_id: update.order_id,
            event_type: update.event_type,
            status: update.status,
            at: update.at,
            details: update.details,
        }
    }
}

fn parse_order_id(raw: &str) -> Result<OrderId, ApiError> {
    let uuid = uuid::Uuid::parse_str(raw)
        .map_err(|e| ApiError::BadRequest(format!("invalid order id: {e}")))?;
    Ok(OrderId::from_uuid(uuid))
}

// -- Handlers --

/// POST /orders — accepts a new order and kicks off the fulfillment saga.
#[tracing::instrument(skip(state, req))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderAggregate>), ApiError> {
    if req.items.is_empty() {
        return Err(ApiError::BadRequest("items must not be empty".to_string()));
    }
    if req.total < 0 {
        return Err(ApiError::BadRequest("total must not be negative".to_string()));
    }

    let items = req
        .items
        .into_iter()
        .map(|item| OrderItem {
            sku: item.sku,
            qty: item.qty,
        })
        .collect();

    let order = state.order_service.create_order(items, req.total).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// GET /orders — lists every known order.
pub async fn list(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<OrderAggregate>>, ApiError> {
    Ok(Json(state.order_service.list_orders().await?))
}

/// GET /orders/{id} — fetches one order with its status history.
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OrderAggregate>, ApiError> {
    let order_id = parse_order_id(&id)?;
    state
        .order_service
        .get_order(order_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("order {order_id} not found")))
}

/// GET /orders/{id}/projection — fetches the read-model view of an order.
pub async fn projection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OrderProjection>, ApiError> {
    let order_id = parse_order_id(&id)?;
    state
        .projections
        .get(order_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no projection for order {order_id}")))
}

/// GET /orders/{id}/stream — server-sent events with live status updates.
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let updates = state.hub.subscribe(order_id);

    let stream = futures_util::stream::unfold(updates, |mut updates| async move {
        let update = updates.recv().await?;
        let event = Event::default()
            .json_data(OrderUpdateResponse::from(update))
            .unwrap_or_else(|_| Event::default().data("serialization error"));
        Some((Ok(event), updates))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
