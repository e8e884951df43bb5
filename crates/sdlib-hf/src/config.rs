//! Registry client configuration.

use url::Url;

/// Configuration for the registry client.
#[derive(Debug, Clone)]
pub struct HfConfig {
    /// Registry root, e.g. `https://huggingface.co`.
    pub base_url: Url,
    /// Optional bearer token for gated repositories.
    pub token: Option<String>,
    /// Maximum retries for transient failures.
    pub max_retries: u8,
    /// Base delay for exponential backoff.
    pub retry_base_delay_ms: u64,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for HfConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("https://huggingface.co").expect("default base url is valid"),
            token: None,
            max_retries: 3,
            retry_base_delay_ms: 500,
            timeout_secs: 30,
        }
    }
}

impl HfConfig {
    /// Point the client at a different registry root (used by tests
    /// against local fixtures).
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_huggingface() {
        let config = HfConfig::default();
        assert_eq!(config.base_url.as_str(), "https://huggingface.co/");
        assert_eq!(config.max_retries, 3);
        assert!(config.token.is_none());
    }
}
