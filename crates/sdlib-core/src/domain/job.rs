//! Job records: the persisted unit of generation work.
//!
//! Queue and history are one table, so a `Job` carries both the request
//! fields and the completion fields (status, progress, timings, error).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::ImageSize;

/// The kind of generation a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Text-to-image.
    Generate,
    /// Image-to-image with a prompt (optionally masked).
    Edit,
    /// Image variation from a source image.
    Variation,
    /// Upscale a source image.
    Upscale,
}

impl JobType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Edit => "edit",
            Self::Variation => "variation",
            Self::Upscale => "upscale",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generate" => Ok(Self::Generate),
            "edit" => Ok(Self::Edit),
            "variation" => Ok(Self::Variation),
            "upscale" => Ok(Self::Upscale),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// Job lifecycle status.
///
/// Valid transitions: `pending → processing → completed | failed`, and
/// `pending → cancelled`. Everything else is a bug in the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Cancelled)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Quality hint mapped onto a step count on the CLI path when the job
/// carries no explicit `sample_steps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Draft,
    Standard,
    High,
}

impl Quality {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Standard => "standard",
            Self::High => "high",
        }
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "standard" => Ok(Self::Standard),
            "high" => Ok(Self::High),
            other => Err(format!("unknown quality: {other}")),
        }
    }
}

/// Default strength applied to `variation` jobs that omit one.
pub const DEFAULT_VARIATION_STRENGTH: f64 = 0.75;

/// A persisted generation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub model_id: String,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub size: Option<ImageSize>,
    pub seed: Option<i64>,
    /// Batch size.
    pub n: u32,
    pub quality: Option<Quality>,
    pub style: Option<String>,
    /// Path of the uploaded source image, for edit/variation/upscale.
    pub source_image: Option<String>,
    /// Path of the uploaded mask image, for inpainting edits.
    pub mask_image: Option<String>,
    /// Denoising strength in `[0, 1]`.
    pub strength: Option<f64>,
    pub cfg_scale: Option<f64>,
    pub sample_steps: Option<u32>,
    pub sampling_method: Option<String>,
    pub clip_skip: Option<u32>,
    pub status: JobStatus,
    /// Fraction complete in `[0, 1]`, monotone over the job's lifetime.
    pub progress: f64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub model_loading_time_ms: Option<i64>,
    pub generation_time_ms: Option<i64>,
}

impl Job {
    /// Effective strength: explicit value, else the variation default,
    /// else none.
    pub fn effective_strength(&self) -> Option<f64> {
        match (self.strength, self.job_type) {
            (Some(s), _) => Some(s),
            (None, JobType::Variation) => Some(DEFAULT_VARIATION_STRENGTH),
            (None, _) => None,
        }
    }
}

/// Fields supplied when enqueueing a job. The store assigns id, status,
/// progress, and timestamps.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub job_type: Option<JobType>,
    pub model_id: String,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub size: Option<ImageSize>,
    pub seed: Option<i64>,
    pub n: Option<u32>,
    pub quality: Option<Quality>,
    pub style: Option<String>,
    pub source_image: Option<String>,
    pub mask_image: Option<String>,
    pub strength: Option<f64>,
    pub cfg_scale: Option<f64>,
    pub sample_steps: Option<u32>,
    pub sampling_method: Option<String>,
    pub clip_skip: Option<u32>,
}

/// A persisted generated image owned by a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub id: i64,
    pub job_id: Uuid,
    /// Index within the job's batch.
    pub batch_index: u32,
    pub mime_type: String,
    /// Raw image bytes. Skipped on the wire; clients fetch the binary from
    /// the image URL instead.
    #[serde(skip_serializing)]
    pub data: Vec<u8>,
    pub revised_prompt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl GeneratedImage {
    /// Stable URL the HTTP layer serves this image's bytes from.
    pub fn url(&self) -> String {
        format!("/api/images/{}", self.id)
    }
}

/// Fields for inserting a generated image.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub batch_index: u32,
    pub mime_type: String,
    pub data: Vec<u8>,
    pub revised_prompt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Listing filter for the job store.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
}

/// One page of a job listing.
#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
    #[serde(rename = "hasMore")]
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Processing.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Cancelled.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn variation_defaults_strength() {
        let mut job = job_fixture(JobType::Variation);
        assert_eq!(job.effective_strength(), Some(DEFAULT_VARIATION_STRENGTH));

        job.strength = Some(0.4);
        assert_eq!(job.effective_strength(), Some(0.4));
    }

    #[test]
    fn upscale_has_no_default_strength() {
        let job = job_fixture(JobType::Upscale);
        assert_eq!(job.effective_strength(), None);
    }

    fn job_fixture(job_type: JobType) -> Job {
        Job {
            id: Uuid::new_v4(),
            job_type,
            model_id: "m1".into(),
            prompt: "a cat".into(),
            negative_prompt: None,
            size: None,
            seed: None,
            n: 1,
            quality: None,
            style: None,
            source_image: None,
            mask_image: None,
            strength: None,
            cfg_scale: None,
            sample_steps: None,
            sampling_method: None,
            clip_skip: None,
            status: JobStatus::Pending,
            progress: 0.0,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            completed_at: None,
            model_loading_time_ms: None,
            generation_time_ms: None,
        }
    }
}
