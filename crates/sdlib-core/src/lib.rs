//! Core domain types, configuration, events, and error kinds for sdlib.
//!
//! This crate is dependency-light by design: it defines the vocabulary the
//! rest of the workspace speaks (model descriptors, jobs, downloads, the
//! event union and bus) without pulling in any adapter-specific crates.

pub mod config;
pub mod domain;
pub mod error;
pub mod events;

pub use config::ModelsConfig;
pub use domain::download::{DownloadFile, DownloadJob, DownloadStatus};
pub use domain::job::{
    GeneratedImage, Job, JobFilter, JobPage, JobStatus, JobType, NewImage, NewJob, Quality,
};
pub use domain::model::{
    Capability, ExecMode, GenerationDefaults, ImageSize, LoadMode, ModelDescriptor,
    DEFAULT_STARTUP_TIMEOUT_MS,
};
pub use error::{DownloadError, JobError, ProcessError, RepositoryError};
pub use events::{AppEvent, EventBus, Subscription, Topic};
