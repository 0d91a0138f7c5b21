//! Error types for the merge pipeline and API responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::path::PathBuf;

/// Failure of a combine-and-activate run, tagged by the stage class that failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    /// One or both requested artifacts are missing; nothing was loaded
    #[error("One or both files do not exist. Please check the file paths.")]
    NotFound,

    /// Loading or saving an artifact failed; no cache or slot mutation happened
    #[error("I/O failure on {}: {message}", path.display())]
    Io { path: PathBuf, message: String },

    /// Registration, device placement or hook installation failed after the
    /// merged artifact was written
    #[error("activation failed: {message}")]
    Activation { message: String },
}

impl MergeError {
    pub fn io(path: impl Into<PathBuf>, err: &anyhow::Error) -> Self {
        MergeError::Io {
            path: path.into(),
            message: format!("{:#}", err),
        }
    }

    pub fn activation(err: &anyhow::Error) -> Self {
        MergeError::Activation {
            message: format!("{:#}", err),
        }
    }

    /// Status line shown to the operator
    pub fn status_line(&self) -> String {
        match self {
            MergeError::NotFound => format!("Error: {}", self),
            _ => format!("Error loading UNet and non-UNet parts: {}", self),
        }
    }
}

pub type MergeResult<T> = std::result::Result<T, MergeError>;

/// API error types
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<MergeError> for ApiError {
    fn from(err: MergeError) -> Self {
        match err {
            MergeError::NotFound => ApiError::NotFound(err.status_line()),
            _ => ApiError::Internal(err.status_line()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}
