//! Projection error types.

use thiserror::Error;

/// Errors that can occur on the query side.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Event validation error.
    #[error("Validation error: {0}")]
    Validation(#[from] events::ValidationError),
}

/// Convenience type alias for projection results.
pub type Result<T> = std::result::Result<T, ProjectionError>;
