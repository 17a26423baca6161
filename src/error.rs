use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed input: wrong vector dimension, empty query, out-of-range k.
    #[error("Shape error: {0}")]
    ShapeError(String),

    /// The embedding model or upstream store returned a 4xx we can't retry our way out of.
    #[error("Client error: {0}")]
    ClientError(String),

    /// Embedding generation failed after retries.
    #[error("Embedding error: {0}")]
    EmbeddingError(String),

    /// Upstream store call failed after retries.
    #[error("Upstream error: {0}")]
    UpstreamError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource exhaustion: cache full, index at capacity, etc.
    #[error("Resource error: {0}")]
    ResourceError(String),

    /// The operation was cancelled (shutdown in progress, deadline exceeded).
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::ShapeError(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::ClientError(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::EmbeddingError(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            AppError::UpstreamError(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::ResourceError(_) => (StatusCode::INSUFFICIENT_STORAGE, self.to_string()),
            AppError::Cancelled(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            AppError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Serde(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = json!({
            "error": message,
            "status": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
