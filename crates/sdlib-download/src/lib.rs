//! Resumable multi-file download engine for sdlib.
//!
//! Downloads registry files sequentially with HTTP range requests, live
//! per-file and aggregate progress, cancellation, and pause/resume. State
//! is persisted through `sdlib-db` so an interrupted download can resume
//! with range requests after a restart.

mod engine;
mod progress;

pub use engine::{DownloadEngine, DownloadEngineConfig};
pub use progress::{eta_seconds, parse_content_range_total, ProgressThrottle, SpeedTracker};
