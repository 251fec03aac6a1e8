//! API error types with structured JSON responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::db::DatabaseError;
use crate::llm::LlmError;
use crate::storage::StorageError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

/// API-level errors with HTTP status mapping. Internal detail is logged,
/// never returned; all client-visible messages are ASCII.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Invalid or inactive API key")]
    Forbidden,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Resource busy: {0}")]
    Busy(String),
    #[error("Uploaded file too large")]
    PayloadTooLarge,
    #[error("Upstream model unavailable")]
    UpstreamUnavailable { retry_after: u64 },
    #[error("Storage unavailable: {0}")]
    Storage(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::BadRequest(detail) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", detail.clone())
            }
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                "Invalid or inactive API key".to_string(),
            ),
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, "NOT_FOUND", detail.clone()),
            ApiError::Busy(detail) => (StatusCode::CONFLICT, "BUSY", detail.clone()),
            ApiError::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                "Uploaded file exceeds the size limit".to_string(),
            ),
            ApiError::UpstreamUnavailable { retry_after } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "UPSTREAM_UNAVAILABLE",
                format!("Model endpoint unavailable. Retry after {retry_after}s"),
            ),
            ApiError::Storage(detail) => {
                tracing::error!(detail, "Storage failure");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "STORAGE_UNAVAILABLE",
                    "Persistence layer unavailable".to_string(),
                )
            }
            ApiError::Internal(detail) => {
                tracing::error!(detail, "API internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorBody {
            error: ErrorDetail { code, message },
        };
        let mut response = (status, Json(body)).into_response();
        if let ApiError::UpstreamUnavailable { retry_after } = &self {
            if let Ok(value) = axum::http::HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        ApiError::Storage(err.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            // Traversal attempts and missing files look the same to the
            // caller.
            StorageError::NotFound | StorageError::InvalidPath(_) => {
                ApiError::NotFound("file not found".into())
            }
            StorageError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ApiError::NotFound("file not found".into())
            }
            StorageError::Io(e) => ApiError::Storage(e.to_string()),
        }
    }
}

impl From<LlmError> for ApiError {
    fn from(err: LlmError) -> Self {
        tracing::warn!(error = %err, "Upstream model failure surfaced to caller");
        ApiError::UpstreamUnavailable { retry_after: 30 }
    }
}
