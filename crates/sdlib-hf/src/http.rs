//! HTTP backend abstraction for the registry API.
//!
//! The production backend wraps reqwest; tests inject a canned-response
//! fake instead. Failures are split into transient ones (the registry
//! occasionally 503s under load, and connections to it drop) which get
//! retried with doubling delays, and final ones which surface
//! immediately.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use url::Url;

use crate::config::HfConfig;
use crate::error::{HfError, HfResult};

/// Trait for HTTP backends that can fetch JSON from registry URLs.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    /// Fetch JSON from a URL and deserialize it.
    async fn get_json<T: DeserializeOwned + Send>(&self, url: &Url) -> HfResult<T>;
}

/// Outcome of a single request attempt that did not yield a response.
enum AttemptError {
    /// Worth another attempt after a backoff delay.
    Transient(HfError),
    /// No amount of retrying will change the answer.
    Final(HfError),
}

/// Production backend: reqwest with bounded retry.
pub struct ReqwestBackend {
    client: reqwest::Client,
    max_retries: u8,
    retry_base_delay_ms: u64,
    auth_token: Option<String>,
}

impl ReqwestBackend {
    pub fn new(config: &HfConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to create HTTP client");

        Self {
            client,
            max_retries: config.max_retries,
            retry_base_delay_ms: config.retry_base_delay_ms,
            auth_token: config.token.clone(),
        }
    }

    /// Delay before retry number `retry` (1-based): base, 2×base, 4×base…
    fn backoff_delay(&self, retry: u8) -> Duration {
        let factor = 1u64 << u32::from(retry - 1).min(16);
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }

    async fn get_with_backoff(&self, url: &Url) -> HfResult<reqwest::Response> {
        let mut retries_used = 0u8;
        loop {
            match self.try_get(url).await {
                Ok(response) => return Ok(response),
                Err(AttemptError::Final(e)) => return Err(e),
                Err(AttemptError::Transient(e)) => {
                    if retries_used == self.max_retries {
                        return Err(e);
                    }
                    retries_used += 1;
                    tokio::time::sleep(self.backoff_delay(retries_used)).await;
                }
            }
        }
    }

    /// One request attempt, classified for the retry loop.
    async fn try_get(&self, url: &Url) -> Result<reqwest::Response, AttemptError> {
        let mut request = self.client.get(url.as_str());
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Err(AttemptError::Transient(e.into())),
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        // A 404 on a metadata path means the repository itself is gone,
        // which callers handle differently from a flaky registry.
        let error = if status == reqwest::StatusCode::NOT_FOUND {
            repo_from_info_url(url).map_or_else(
                || HfError::ApiRequestFailed {
                    status: status.as_u16(),
                    url: url.to_string(),
                },
                |repo| HfError::RepoNotFound { repo },
            )
        } else {
            HfError::ApiRequestFailed {
                status: status.as_u16(),
                url: url.to_string(),
            }
        };

        if status.is_server_error() {
            Err(AttemptError::Transient(error))
        } else {
            Err(AttemptError::Final(error))
        }
    }
}

/// Repository id (`owner/name`) when the URL is a metadata lookup.
fn repo_from_info_url(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    if segments.next() != Some("api") || segments.next() != Some("models") {
        return None;
    }
    let owner = segments.next().filter(|s| !s.is_empty())?;
    let name = segments.next().filter(|s| !s.is_empty())?;
    Some(format!("{owner}/{name}"))
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn get_json<T: DeserializeOwned + Send>(&self, url: &Url) -> HfResult<T> {
        let response = self.get_with_backoff(url).await?;
        let data: T = response.json().await?;
        Ok(data)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// A fake HTTP backend that returns canned JSON by URL substring.
    pub struct FakeBackend {
        responses: Mutex<HashMap<String, serde_json::Value>>,
    }

    impl FakeBackend {
        pub fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
            }
        }

        pub fn with_response(self, url_contains: &str, json: serde_json::Value) -> Self {
            self.responses
                .lock()
                .unwrap()
                .insert(url_contains.to_string(), json);
            self
        }

        fn find_response(&self, url: &str) -> Option<serde_json::Value> {
            let responses = self.responses.lock().unwrap();
            responses
                .iter()
                .find(|(pattern, _)| url.contains(pattern.as_str()))
                .map(|(_, json)| json.clone())
        }
    }

    #[async_trait]
    impl HttpBackend for FakeBackend {
        async fn get_json<T: DeserializeOwned + Send>(&self, url: &Url) -> HfResult<T> {
            let json = self.find_response(url.as_str()).ok_or_else(|| {
                repo_from_info_url(url).map_or(
                    HfError::ApiRequestFailed {
                        status: 404,
                        url: url.to_string(),
                    },
                    |repo| HfError::RepoNotFound { repo },
                )
            })?;
            serde_json::from_value(json).map_err(Into::into)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn metadata_urls_yield_a_repo_id() {
        assert_eq!(
            repo_from_info_url(&url("https://huggingface.co/api/models/stabilityai/sd-turbo")),
            Some("stabilityai/sd-turbo".to_string())
        );
        assert_eq!(
            repo_from_info_url(&url("https://huggingface.co/api/models/org/model/tree/main")),
            Some("org/model".to_string())
        );
    }

    #[test]
    fn non_metadata_urls_yield_nothing() {
        assert_eq!(
            repo_from_info_url(&url("https://huggingface.co/api/models/")),
            None
        );
        assert_eq!(
            repo_from_info_url(&url("https://huggingface.co/api/models/lonely")),
            None
        );
        assert_eq!(
            repo_from_info_url(&url("https://huggingface.co/org/model/resolve/main/f.bin")),
            None
        );
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let backend = ReqwestBackend::new(&HfConfig::default());
        assert_eq!(backend.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backend.backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(backend.backoff_delay(3), Duration::from_millis(2000));
    }

    #[test]
    fn backend_creation_reads_config() {
        let config = HfConfig::default().with_token("secret");
        let backend = ReqwestBackend::new(&config);
        assert_eq!(backend.max_retries, 3);
        assert_eq!(backend.auth_token.as_deref(), Some("secret"));
    }
}
