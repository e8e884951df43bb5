//! Registry API response types.

use serde::{Deserialize, Serialize};

/// A file entry in a repository's `siblings` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HfSibling {
    /// Path within the repository.
    pub rfilename: String,
    /// File size, when the registry exposes it.
    #[serde(default)]
    pub size: Option<u64>,
}

/// Repository metadata from `GET {base}/api/models/{repo}`.
///
/// The registry exposes this under two source-level call sites (model info
/// and model files); both are one endpoint, so the client has one
/// operation returning this type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HfModelInfo {
    /// Repository id (`owner/name`).
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub siblings: Vec<HfSibling>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub downloads: Option<u64>,
    #[serde(default)]
    pub likes: Option<u64>,
}

impl HfModelInfo {
    /// File paths listed by the repository.
    pub fn file_paths(&self) -> Vec<&str> {
        self.siblings.iter().map(|s| s.rfilename.as_str()).collect()
    }
}
