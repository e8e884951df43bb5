//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use sdlib_core::{DownloadError, JobError, ProcessError, RepositoryError};

/// Axum-facing error type.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
    status: u16,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            Self::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = ErrorBody {
            error: message,
            status: status.as_u16(),
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<RepositoryError> for HttpError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(msg) => Self::NotFound(msg),
            RepositoryError::Conflict(msg) => Self::Conflict(msg),
            RepositoryError::Storage(msg) => Self::Internal(format!("Storage: {msg}")),
            RepositoryError::Serialization(msg) => {
                Self::Internal(format!("Serialization: {msg}"))
            }
        }
    }
}

impl From<ProcessError> for HttpError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::UnknownModel(id) => Self::NotFound(format!("model {id}")),
            ProcessError::AlreadyRunning(id) => Self::Conflict(format!("model {id} is already running")),
            ProcessError::InvalidRecord(msg) => Self::BadRequest(msg),
            ProcessError::StartFailure { .. }
            | ProcessError::StartupTimeout { .. }
            | ProcessError::PortExhausted { .. }
            | ProcessError::Crashed(_) => Self::ServiceUnavailable(err.to_string()),
            ProcessError::Io(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<DownloadError> for HttpError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::NotFound(msg) => Self::NotFound(msg),
            DownloadError::InvalidRepo(msg) => Self::BadRequest(msg),
            DownloadError::NotResumable(msg) => Self::Conflict(msg),
            DownloadError::Network(msg) => Self::ServiceUnavailable(msg),
            DownloadError::Cancelled => Self::Conflict("download was cancelled".to_string()),
            DownloadError::Integrity(msg) | DownloadError::Io(msg) | DownloadError::Storage(msg) => {
                Self::Internal(msg)
            }
        }
    }
}

impl From<JobError> for HttpError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::UnknownModel(id) => Self::NotFound(format!("model {id}")),
            JobError::Invalid(msg) => Self::BadRequest(msg),
            JobError::Cancelled => Self::Conflict("job was cancelled".to_string()),
            JobError::ModelStart(msg) | JobError::Engine(msg) => Self::ServiceUnavailable(msg),
            JobError::Storage(msg) => Self::Internal(msg),
        }
    }
}
