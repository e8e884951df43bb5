//! High-level registry client.

use std::sync::Arc;

use url::Url;

use crate::config::HfConfig;
use crate::error::HfResult;
use crate::http::{HttpBackend, ReqwestBackend};
use crate::models::HfModelInfo;
use crate::url::{build_download_url, build_model_info_url};

/// Registry client: metadata lookups and download URL construction.
pub struct HfClient<B: HttpBackend = ReqwestBackend> {
    config: HfConfig,
    backend: Arc<B>,
}

impl HfClient {
    /// Create a client backed by reqwest.
    pub fn new(config: HfConfig) -> Self {
        let backend = Arc::new(ReqwestBackend::new(&config));
        Self { config, backend }
    }
}

impl<B: HttpBackend> HfClient<B> {
    #[cfg(test)]
    fn with_backend(config: HfConfig, backend: Arc<B>) -> Self {
        Self { config, backend }
    }

    /// Fetch repository metadata, including the `siblings` file list.
    pub async fn model_info(&self, repo: &str) -> HfResult<HfModelInfo> {
        let url = build_model_info_url(&self.config, repo);
        self.backend.get_json(&url).await
    }

    /// Validate that a repository exists and is readable.
    ///
    /// Returns the metadata so callers can reuse the file list without a
    /// second round trip.
    pub async fn validate_repo(&self, repo: &str) -> HfResult<HfModelInfo> {
        self.model_info(repo).await
    }

    /// Download URL for a file in a repository.
    pub fn download_url(&self, repo: &str, file_path: &str) -> Url {
        build_download_url(&self.config, repo, file_path)
    }

    pub const fn config(&self) -> &HfConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HfError;
    use crate::http::testing::FakeBackend;

    fn client_with(backend: FakeBackend) -> HfClient<FakeBackend> {
        HfClient::with_backend(HfConfig::default(), Arc::new(backend))
    }

    #[tokio::test]
    async fn model_info_returns_siblings() {
        let backend = FakeBackend::new().with_response(
            "api/models/org/model",
            serde_json::json!({
                "id": "org/model",
                "siblings": [{"rfilename": "model.safetensors", "size": 42}]
            }),
        );

        let info = client_with(backend).model_info("org/model").await.unwrap();
        assert_eq!(info.id, "org/model");
        assert_eq!(info.siblings.len(), 1);
    }

    #[tokio::test]
    async fn missing_repo_maps_to_repo_not_found() {
        let result = client_with(FakeBackend::new()).model_info("no/such").await;
        assert!(matches!(
            result,
            Err(HfError::RepoNotFound { repo }) if repo == "no/such"
        ));
    }

    #[test]
    fn download_url_uses_resolve_main() {
        let client = HfClient::new(HfConfig::default());
        assert_eq!(
            client.download_url("org/model", "model.safetensors").as_str(),
            "https://huggingface.co/org/model/resolve/main/model.safetensors"
        );
    }
}
