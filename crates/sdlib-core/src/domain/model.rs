//! Model descriptors and their generation defaults.
//!
//! Descriptors are static configuration: they describe how to launch an
//! inference engine and which defaults it generates with. Runtime state
//! (pids, ports, health) lives in the process registry, not here.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default engine startup timeout when neither the caller nor the
/// descriptor provides one.
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 90_000;

/// How an engine executable is invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Long-running HTTP server; started once, reused across jobs.
    #[default]
    Server,
    /// One-shot process invoked per job with job-specific arguments.
    Cli,
}

impl ExecMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Cli => "cli",
        }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Self::Server),
            "cli" => Ok(Self::Cli),
            other => Err(format!("unknown exec mode: {other}")),
        }
    }
}

/// Whether the engine is started lazily per-request or at boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Started the first time a job needs it.
    #[default]
    OnDemand,
    /// Started by the composition root at system startup.
    Preload,
}

/// Generation capabilities a model advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    TextToImage,
    ImageToImage,
    Inpaint,
    Upscale,
}

/// An image size expressed as `WIDTHxHEIGHT` on the wire (e.g. `"512x512"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for ImageSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("invalid size '{s}', expected WIDTHxHEIGHT"))?;
        let width: u32 = w
            .trim()
            .parse()
            .map_err(|_| format!("invalid width in size '{s}'"))?;
        let height: u32 = h
            .trim()
            .parse()
            .map_err(|_| format!("invalid height in size '{s}'"))?;
        if width == 0 || height == 0 {
            return Err(format!("size '{s}' must be non-zero"));
        }
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for ImageSize {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ImageSize> for String {
    fn from(size: ImageSize) -> Self {
        size.to_string()
    }
}

/// Per-model generation defaults applied when a job omits a parameter.
///
/// All fields are optional: an absent default means the parameter is
/// omitted from the engine request entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationDefaults {
    pub cfg_scale: Option<f64>,
    pub sample_steps: Option<u32>,
    pub sampling_method: Option<String>,
    pub size: Option<ImageSize>,
}

/// Static description of a model backend, loaded from the config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Stable identifier referenced by jobs.
    pub id: String,
    /// Display name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Engine executable path.
    pub command: String,
    /// Ordered argument list; a literal `{port}` is substituted at spawn time.
    #[serde(default)]
    pub args: Vec<String>,
    /// Base API URL for `server` mode engines. The `{port}` placeholder is
    /// substituted with the allocated port.
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub load_mode: LoadMode,
    #[serde(default)]
    pub exec_mode: ExecMode,
    /// Preferred port; auto-assigned from the scan range if taken.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub startup_timeout_ms: Option<u64>,
    #[serde(default)]
    pub generation_params: GenerationDefaults,
    /// Registry repository this model can be fetched from.
    #[serde(default)]
    pub registry_repo: Option<String>,
    /// Files to fetch from `registry_repo`.
    #[serde(default)]
    pub registry_files: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl ModelDescriptor {
    /// Effective startup timeout: descriptor value, else the system default.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms.unwrap_or(DEFAULT_STARTUP_TIMEOUT_MS))
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Resolve the engine API URL for an allocated port.
    ///
    /// Returns `None` for `cli` mode models, which have no HTTP endpoint.
    pub fn resolved_api_url(&self, port: u16) -> Option<String> {
        if self.exec_mode == ExecMode::Cli {
            return None;
        }
        Some(self.api_url.as_ref().map_or_else(
            || format!("http://127.0.0.1:{port}"),
            |url| url.replace("{port}", &port.to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_size_parses_and_formats() {
        let size: ImageSize = "512x768".parse().unwrap();
        assert_eq!(size, ImageSize::new(512, 768));
        assert_eq!(size.to_string(), "512x768");
    }

    #[test]
    fn image_size_rejects_garbage() {
        assert!("512".parse::<ImageSize>().is_err());
        assert!("0x512".parse::<ImageSize>().is_err());
        assert!("axb".parse::<ImageSize>().is_err());
    }

    #[test]
    fn descriptor_defaults_from_minimal_json() {
        let json = serde_json::json!({
            "id": "sd15",
            "name": "Stable Diffusion 1.5",
            "command": "/opt/sd/bin/sd-server"
        });
        let desc: ModelDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(desc.exec_mode, ExecMode::Server);
        assert_eq!(desc.load_mode, LoadMode::OnDemand);
        assert_eq!(
            desc.startup_timeout(),
            Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS)
        );
        assert!(desc.generation_params.sample_steps.is_none());
    }

    #[test]
    fn resolved_api_url_substitutes_port() {
        let json = serde_json::json!({
            "id": "m",
            "name": "m",
            "command": "sd",
            "api_url": "http://127.0.0.1:{port}"
        });
        let desc: ModelDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(
            desc.resolved_api_url(8123).as_deref(),
            Some("http://127.0.0.1:8123")
        );
    }

    #[test]
    fn resolved_api_url_is_none_for_cli() {
        let json = serde_json::json!({
            "id": "m",
            "name": "m",
            "command": "sd",
            "exec_mode": "cli"
        });
        let desc: ModelDescriptor = serde_json::from_value(json).unwrap();
        assert!(desc.resolved_api_url(8123).is_none());
    }
}
