//! Registry client error types.

use thiserror::Error;

pub type HfResult<T> = Result<T, HfError>;

/// Errors from the registry client.
#[derive(Debug, Error)]
pub enum HfError {
    #[error("repository not found: {repo}")]
    RepoNotFound { repo: String },

    #[error("registry request failed with status {status}: {url}")]
    ApiRequestFailed { status: u16, url: String },

    #[error("invalid registry response: {message}")]
    InvalidResponse { message: String },

    #[error("network error: {0}")]
    Network(String),
}

impl From<reqwest::Error> for HfError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<serde_json::Error> for HfError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

impl From<HfError> for sdlib_core::DownloadError {
    fn from(err: HfError) -> Self {
        match err {
            HfError::RepoNotFound { repo } => Self::InvalidRepo(repo),
            HfError::ApiRequestFailed { status, url } => {
                Self::Network(format!("registry returned {status} for {url}"))
            }
            HfError::InvalidResponse { message } => Self::InvalidRepo(message),
            HfError::Network(message) => Self::Network(message),
        }
    }
}
