use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use projections::ProjectionError;
use saga::SagaError;
use serde_json::json;

/// Errors returned by API handlers, mapped onto HTTP status codes.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Saga(#[from] SagaError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ProjectionError> for ApiError {
    fn from(err: ProjectionError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Saga(err) => match err {
                SagaError::OrderNotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
                SagaError::OrderAlreadyExists(_) | SagaError::InvalidTransition { .. } => {
                    (StatusCode::CONFLICT, err.to_string())
                }
                SagaError::Validation(_) => (StatusCode::BAD_REQUEST, err.to_string()),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            },
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        if status.is_server_error() {
            tracing::error!(%status, error = %self, "request failed");
        }

        (status, Json(json!({ "error": message }))).into_response()
    }
}
