//! URL construction helpers for the registry API.
//!
//! Pure functions so URL shapes are testable without a network.

use url::Url;

use crate::config::HfConfig;

/// Build the metadata URL: `{base}/api/models/{repo}`.
pub fn build_model_info_url(config: &HfConfig, repo: &str) -> Url {
    let mut url = config.base_url.clone();
    let base_path = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{base_path}/api/models/{repo}"));
    url
}

/// Build a file download URL: `{base}/{repo}/resolve/main/{path}`.
///
/// Path components are percent-encoded individually so nested paths keep
/// their separators.
pub fn build_download_url(config: &HfConfig, repo: &str, file_path: &str) -> Url {
    let encoded: Vec<String> = file_path
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    let mut url = config.base_url.clone();
    let base_path = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!(
        "{base_path}/{repo}/resolve/main/{}",
        encoded.join("/")
    ));
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_info_url() {
        let config = HfConfig::default();
        let url = build_model_info_url(&config, "stabilityai/sd-turbo");
        assert_eq!(
            url.as_str(),
            "https://huggingface.co/api/models/stabilityai/sd-turbo"
        );
    }

    #[test]
    fn download_url_keeps_separators() {
        let config = HfConfig::default();
        let url = build_download_url(&config, "stabilityai/sd-turbo", "vae/decoder.safetensors");
        assert_eq!(
            url.as_str(),
            "https://huggingface.co/stabilityai/sd-turbo/resolve/main/vae/decoder.safetensors"
        );
    }

    #[test]
    fn download_url_encodes_special_characters() {
        let config = HfConfig::default();
        let url = build_download_url(&config, "org/model", "weights/model v2.bin");
        assert_eq!(
            url.as_str(),
            "https://huggingface.co/org/model/resolve/main/weights/model%20v2.bin"
        );
    }

    #[test]
    fn respects_non_default_base() {
        let config =
            HfConfig::default().with_base_url(Url::parse("http://127.0.0.1:9999").unwrap());
        let url = build_model_info_url(&config, "a/b");
        assert_eq!(url.as_str(), "http://127.0.0.1:9999/api/models/a/b");
    }
}
