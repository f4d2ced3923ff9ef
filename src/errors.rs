use crate::{services::assembly::AssemblyState, storage::BackendError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Failures of the server-side upload pipeline.
///
/// Display strings are safe to show to end users: they never carry storage
/// keys. Backend detail is logged where the error is raised.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("upload incomplete: expected {expected} chunks, found {found}")]
    ChunkCountMismatch { expected: u64, found: u64 },
    #[error("assembly failed while {stage}: {reason}")]
    Assembly {
        stage: AssemblyState,
        reason: String,
    },
    #[error("upload {0} is already being assembled")]
    AssemblyInProgress(String),
    #[error("upload url has expired")]
    UrlExpired,
    #[error("upload url signature is invalid")]
    InvalidSignature,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "authentication required")
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("unhandled error: {:#}", err);
        AppError::internal("internal error")
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::InvalidChunk(_) | UploadError::InvalidRequest(_) => {
                AppError::bad_request(err.to_string())
            }
            UploadError::AssemblyInProgress(_) => AppError::new(StatusCode::CONFLICT, err.to_string()),
            UploadError::UrlExpired | UploadError::InvalidSignature => {
                AppError::new(StatusCode::FORBIDDEN, err.to_string())
            }
            UploadError::ChunkCountMismatch { .. } | UploadError::Assembly { .. } => {
                AppError::internal(err.to_string())
            }
            UploadError::Backend(backend) => backend.into(),
        }
    }
}

impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(_) => AppError::not_found("object not found"),
            BackendError::NoSuchUpload(_) => AppError::not_found("multipart upload not found"),
            BackendError::EntityTooSmall { .. }
            | BackendError::InvalidPart(_)
            | BackendError::InvalidPartOrder => AppError::bad_request(err.to_string()),
            BackendError::InvalidKey => AppError::bad_request("invalid object key"),
            BackendError::Sqlx(_) | BackendError::Io(_) => {
                tracing::error!("storage failure: {}", err);
                AppError::internal("storage error")
            }
        }
    }
}
