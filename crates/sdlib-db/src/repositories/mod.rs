//! SQLite repository implementations.

pub mod downloads;
pub mod jobs;
pub mod models;
pub mod processes;

pub use downloads::DownloadStateRepository;
pub use jobs::{JobRepository, StatusExtras};
pub use models::ModelMirrorRepository;
pub use processes::{ProcessStateRepository, ProcessStateRow};

use chrono::{DateTime, Utc};
use sdlib_core::RepositoryError;

/// Current time as the RFC 3339 text stored in timestamp columns.
pub(crate) fn now_str() -> String {
    Utc::now().to_rfc3339()
}

/// Parse a stored RFC 3339 timestamp.
pub(crate) fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Serialization(format!("bad timestamp '{text}': {e}")))
}

pub(crate) fn map_storage_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Storage(e.to_string())
}
