//! Canonical event union for all subscribers.
//!
//! This module is the single source of truth for events flowing from the
//! job processor, model manager, and download engine to WebSocket clients
//! and in-process listeners.
//!
//! # Wire format
//!
//! Events are serialized with a `type` tag:
//!
//! ```json
//! { "type": "job_progress", "jobId": "…", "progress": 0.3 }
//! ```

mod bus;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use bus::{EventBus, Subscription};

use crate::domain::download::DownloadStatus;
use crate::domain::job::JobType;

/// Subscription topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    /// Job lifecycle events.
    Queue,
    /// Generated-image record creation.
    Generations,
    /// Engine process state changes.
    Models,
    /// Download progress and state changes.
    Downloads,
}

/// Canonical event types for all subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    // ========== Queue events ==========
    /// A job was enqueued.
    JobQueued {
        #[serde(rename = "jobId")]
        job_id: Uuid,
        #[serde(rename = "jobType")]
        job_type: JobType,
        #[serde(rename = "modelId")]
        model_id: String,
    },

    /// The processor claimed a job and began work.
    JobStarted {
        #[serde(rename = "jobId")]
        job_id: Uuid,
    },

    /// Progress update for an in-flight job.
    JobProgress {
        #[serde(rename = "jobId")]
        job_id: Uuid,
        /// Fraction complete in `[0, 1]`.
        progress: f64,
    },

    /// A job finished successfully.
    JobCompleted {
        #[serde(rename = "jobId")]
        job_id: Uuid,
        #[serde(rename = "imageCount")]
        image_count: u32,
    },

    /// A job failed; the message matches the persisted error column.
    JobFailed {
        #[serde(rename = "jobId")]
        job_id: Uuid,
        error: String,
    },

    /// A pending job was cancelled.
    JobCancelled {
        #[serde(rename = "jobId")]
        job_id: Uuid,
    },

    // ========== Generation events ==========
    /// A generated image record was written.
    ImageGenerated {
        #[serde(rename = "jobId")]
        job_id: Uuid,
        #[serde(rename = "imageId")]
        image_id: i64,
        #[serde(rename = "batchIndex")]
        batch_index: u32,
        /// Stable URL the image binary is served from.
        url: String,
    },

    // ========== Model events ==========
    /// An engine process changed state.
    ModelStateChanged {
        #[serde(rename = "modelId")]
        model_id: String,
        /// New process status (`starting`, `running`, `stopping`, …).
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },

    // ========== Download events ==========
    /// Per-file and aggregate progress for an active download.
    DownloadProgress {
        #[serde(rename = "downloadId")]
        download_id: Uuid,
        /// Remote path of the file currently transferring.
        file: String,
        #[serde(rename = "fileDownloaded")]
        file_downloaded: u64,
        #[serde(rename = "fileTotal")]
        file_total: u64,
        #[serde(rename = "bytesDownloaded")]
        bytes_downloaded: u64,
        #[serde(rename = "totalBytes")]
        total_bytes: u64,
        /// Aggregate fraction complete in `[0, 1]`.
        progress: f64,
        #[serde(rename = "speedBps")]
        speed_bps: f64,
        #[serde(rename = "etaSeconds", skip_serializing_if = "Option::is_none")]
        eta_seconds: Option<f64>,
    },

    /// A download moved to a new lifecycle status.
    DownloadStateChanged {
        #[serde(rename = "downloadId")]
        download_id: Uuid,
        status: DownloadStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl AppEvent {
    /// The topic this event is delivered on.
    pub const fn topic(&self) -> Topic {
        match self {
            Self::JobQueued { .. }
            | Self::JobStarted { .. }
            | Self::JobProgress { .. }
            | Self::JobCompleted { .. }
            | Self::JobFailed { .. }
            | Self::JobCancelled { .. } => Topic::Queue,
            Self::ImageGenerated { .. } => Topic::Generations,
            Self::ModelStateChanged { .. } => Topic::Models,
            Self::DownloadProgress { .. } | Self::DownloadStateChanged { .. } => Topic::Downloads,
        }
    }

    /// Event name for wire protocols and logs.
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::JobQueued { .. } => "job:queued",
            Self::JobStarted { .. } => "job:started",
            Self::JobProgress { .. } => "job:progress",
            Self::JobCompleted { .. } => "job:completed",
            Self::JobFailed { .. } => "job:failed",
            Self::JobCancelled { .. } => "job:cancelled",
            Self::ImageGenerated { .. } => "generation:image",
            Self::ModelStateChanged { .. } => "model:state_changed",
            Self::DownloadProgress { .. } => "download:progress",
            Self::DownloadStateChanged { .. } => "download:state_changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = AppEvent::JobProgress {
            job_id: Uuid::nil(),
            progress: 0.3,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"job_progress\""));
        assert!(json.contains("\"jobId\""));
        assert!(json.contains("0.3"));
    }

    #[test]
    fn events_map_to_their_topics() {
        let queued = AppEvent::JobQueued {
            job_id: Uuid::nil(),
            job_type: JobType::Generate,
            model_id: "m".into(),
        };
        assert_eq!(queued.topic(), Topic::Queue);

        let image = AppEvent::ImageGenerated {
            job_id: Uuid::nil(),
            image_id: 1,
            batch_index: 0,
            url: "/api/images/1".into(),
        };
        assert_eq!(image.topic(), Topic::Generations);

        let model = AppEvent::ModelStateChanged {
            model_id: "m".into(),
            status: "running".into(),
            port: Some(8001),
            pid: Some(42),
        };
        assert_eq!(model.topic(), Topic::Models);

        let download = AppEvent::DownloadStateChanged {
            download_id: Uuid::nil(),
            status: DownloadStatus::Completed,
            error: None,
        };
        assert_eq!(download.topic(), Topic::Downloads);
    }

    /// Lock down event names to prevent frontend subscription mismatches.
    #[test]
    fn event_names_are_stable() {
        let cases = [
            (
                AppEvent::JobStarted {
                    job_id: Uuid::nil(),
                },
                "job:started",
            ),
            (
                AppEvent::JobFailed {
                    job_id: Uuid::nil(),
                    error: "x".into(),
                },
                "job:failed",
            ),
            (
                AppEvent::ModelStateChanged {
                    model_id: "m".into(),
                    status: "stopped".into(),
                    port: None,
                    pid: None,
                },
                "model:state_changed",
            ),
        ];
        for (event, expected) in cases {
            assert_eq!(event.event_name(), expected);
        }
    }
}
