//! Hugging Face registry client for sdlib.
//!
//! Fetches model repository metadata (including the `siblings` file list)
//! and builds `resolve/main` download URLs. The HTTP backend retries
//! transient failures and can be swapped for a canned-response fake in
//! tests.

mod client;
mod config;
mod error;
mod http;
mod models;
mod url;

pub use client::HfClient;
pub use config::HfConfig;
pub use error::{HfError, HfResult};
pub use models::{HfModelInfo, HfSibling};
pub use crate::url::{build_download_url, build_model_info_url};
