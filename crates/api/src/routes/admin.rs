//! Operator endpoints for driving stalled sagas forward.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use common::{EventId, OrderId};
use events::{CompensationAction, RetryStep};

use crate::AppState;
use crate::error::ApiError;

fn parse_order_id(raw: &str) -> Result<OrderId, ApiError> {
    let uuid = uuid::Uuid::parse_str(raw)
        .map_err(|e| ApiError::BadRequest(format!("invalid order id: {e}")))?;
    Ok(OrderId::from_uuid(uuid))
}

#[derive(Deserialize)]
pub struct RetryRequest {
    pub step: RetryStep,
}

#[derive(Deserialize)]
pub struct CompensateRequest {
    pub action: CompensationAction,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAccepted {
    pub event_id: EventId,
    pub order_id: String,
}

/// POST /admin/orders/{id}/retry — re-runs a failed saga step.
#[tracing::instrument(skip(state, req))]
pub async fn retry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RetryRequest>,
) -> Result<(StatusCode, Json<CommandAccepted>), ApiError> {
    let order_id = parse_order_id(&id)?;
    let envelope = state.order_service.request_retry(order_id, req.step).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CommandAccepted {
            event_id: envelope.event_id,
            order_id: order_id.to_string(),
        }),
    ))
}

/// POST /admin/orders/{id}/compensate — undoes a completed saga step.
#[tracing::instrument(skip(state, req))]
pub async fn compensate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CompensateRequest>,
) -> Result<(StatusCode, Json<CommandAccepted>), ApiError> {
    let order_id = parse_order_id(&id)?;
    let envelope = state
        .order_service
        .request_compensation(order_id, req.action)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CommandAccepted {
            event_id: envelope.event_id,
            order_id: order_id.to_string(),
        }),
    ))
}
