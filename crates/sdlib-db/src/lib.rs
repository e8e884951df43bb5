//! SQLite persistence for sdlib.
//!
//! Jobs and their completion records share one table so the queue and the
//! history speak a single language; generated images, download state, and
//! the model mirror hang off it.

#![deny(unsafe_code)]

pub mod repositories;
pub mod setup;

pub use repositories::{
    DownloadStateRepository, JobRepository, ModelMirrorRepository, ProcessStateRepository,
    StatusExtras,
};
pub use setup::setup_database;
#[cfg(any(test, feature = "test-utils"))]
pub use setup::setup_test_database;
