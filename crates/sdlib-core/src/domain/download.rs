//! Download records: multi-file registry downloads with resume support.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Download lifecycle status.
///
/// `pending → downloading ⇄ paused → completed | failed | cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown download status: {other}")),
        }
    }
}

/// One file within a download job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFile {
    /// Path within the registry repository.
    pub remote_path: String,
    /// Absolute destination on disk.
    pub destination: PathBuf,
    /// Total size in bytes; 0 until the first response reveals it.
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub complete: bool,
}

impl DownloadFile {
    pub fn new(remote_path: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            remote_path: remote_path.into(),
            destination: destination.into(),
            total_bytes: 0,
            downloaded_bytes: 0,
            complete: false,
        }
    }

    /// Fraction complete in `[0, 1]`; 0 while the total is unknown.
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f64 {
        if self.total_bytes > 0 {
            self.downloaded_bytes as f64 / self.total_bytes as f64
        } else {
            0.0
        }
    }
}

/// A multi-file download job, persisted and mirrored in memory while active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: Uuid,
    /// Registry repository id (`owner/name`).
    pub repo: String,
    pub files: Vec<DownloadFile>,
    pub status: DownloadStatus,
    /// Aggregate bytes downloaded across all files.
    pub bytes_downloaded: u64,
    /// Aggregate total bytes across all files.
    pub total_bytes: u64,
    /// Instantaneous speed in bytes per second.
    pub speed_bps: f64,
    /// Estimated seconds remaining, when the speed is known.
    pub eta_seconds: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl DownloadJob {
    pub fn new(repo: impl Into<String>, files: Vec<DownloadFile>) -> Self {
        let mut job = Self {
            id: Uuid::new_v4(),
            repo: repo.into(),
            files,
            status: DownloadStatus::Pending,
            bytes_downloaded: 0,
            total_bytes: 0,
            speed_bps: 0.0,
            eta_seconds: None,
            started_at: None,
            completed_at: None,
            error: None,
        };
        job.recompute_totals();
        job
    }

    /// Re-derive the aggregate byte counters from the per-file counters.
    pub fn recompute_totals(&mut self) {
        self.bytes_downloaded = self.files.iter().map(|f| f.downloaded_bytes).sum();
        self.total_bytes = self.files.iter().map(|f| f.total_bytes).sum();
    }

    /// Aggregate fraction complete in `[0, 1]`; 0 while totals are unknown.
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f64 {
        if self.total_bytes > 0 {
            self.bytes_downloaded as f64 / self.total_bytes as f64
        } else {
            0.0
        }
    }
}
