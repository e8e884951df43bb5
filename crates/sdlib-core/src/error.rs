//! Error kinds shared across the workspace.
//!
//! Layer-local errors (engine HTTP failures, registry client errors) live in
//! their own crates and are flattened to strings at these boundaries, so
//! core stays free of adapter dependencies.

use thiserror::Error;

/// Errors from the process registry and model manager.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("model {0} is already running")]
    AlreadyRunning(String),

    #[error("failed to start model {model_id}: {reason}")]
    StartFailure { model_id: String, reason: String },

    #[error("model {model_id} did not become ready within {timeout_ms} ms")]
    StartupTimeout { model_id: String, timeout_ms: u64 },

    #[error("no free port in range {start}-{end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("engine process exited unexpectedly: {0}")]
    Crashed(String),

    #[error("invalid process record: {0}")]
    InvalidRecord(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors a job run can fail with; the message becomes the persisted
/// `error` column on the job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("invalid job: {0}")]
    Invalid(String),

    #[error("job was cancelled")]
    Cancelled,

    #[error("model start failed: {0}")]
    ModelStart(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<ProcessError> for JobError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::UnknownModel(id) => Self::UnknownModel(id),
            other => Self::ModelStart(other.to_string()),
        }
    }
}

/// Errors from the download engine.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(String),

    #[error("download was cancelled")]
    Cancelled,

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("download not found: {0}")]
    NotFound(String),

    #[error("invalid repository: {0}")]
    InvalidRepo(String),

    #[error("download is not in a resumable state: {0}")]
    NotResumable(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<RepositoryError> for JobError {
    fn from(err: RepositoryError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<RepositoryError> for DownloadError {
    fn from(err: RepositoryError) -> Self {
        Self::Storage(err.to_string())
    }
}
