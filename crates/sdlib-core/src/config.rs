//! Model configuration document.
//!
//! Descriptors are loaded once at startup from a single declarative JSON
//! document. Runtime code treats the loaded config as immutable.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::model::ModelDescriptor;

/// Errors raised while loading the config document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("duplicate model id in config: {0}")]
    DuplicateModel(String),

    #[error("default_model '{0}' does not match any configured model")]
    UnknownDefault(String),
}

/// The parsed config document: a list of model descriptors plus an
/// optional default model id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
    #[serde(default)]
    pub default_model: Option<String>,
}

impl ModelsConfig {
    /// Load and validate the config document at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for model in &self.models {
            if !seen.insert(model.id.as_str()) {
                return Err(ConfigError::DuplicateModel(model.id.clone()));
            }
        }
        if let Some(default) = &self.default_model {
            if !seen.contains(default.as_str()) {
                return Err(ConfigError::UnknownDefault(default.clone()));
            }
        }
        Ok(())
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.id == model_id)
    }

    /// The configured default model, else the first configured model.
    pub fn default_model(&self) -> Option<&ModelDescriptor> {
        self.default_model
            .as_deref()
            .and_then(|id| self.get(id))
            .or_else(|| self.models.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(json: &serde_json::Value) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{json}").unwrap();
        file
    }

    #[test]
    fn loads_a_valid_document() {
        let file = write_config(&serde_json::json!({
            "models": [
                {"id": "sd15", "name": "SD 1.5", "command": "sd-server"},
                {"id": "up4x", "name": "Upscaler", "command": "sd", "exec_mode": "cli"}
            ],
            "default_model": "sd15"
        }));

        let config = ModelsConfig::load(file.path()).unwrap();
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.default_model().unwrap().id, "sd15");
        assert!(config.get("up4x").is_some());
        assert!(config.get("nope").is_none());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let file = write_config(&serde_json::json!({
            "models": [
                {"id": "m", "name": "a", "command": "x"},
                {"id": "m", "name": "b", "command": "y"}
            ]
        }));

        assert!(matches!(
            ModelsConfig::load(file.path()),
            Err(ConfigError::DuplicateModel(id)) if id == "m"
        ));
    }

    #[test]
    fn rejects_unknown_default() {
        let file = write_config(&serde_json::json!({
            "models": [{"id": "m", "name": "a", "command": "x"}],
            "default_model": "missing"
        }));

        assert!(matches!(
            ModelsConfig::load(file.path()),
            Err(ConfigError::UnknownDefault(_))
        ));
    }

    #[test]
    fn default_falls_back_to_first_model() {
        let file = write_config(&serde_json::json!({
            "models": [
                {"id": "first", "name": "a", "command": "x"},
                {"id": "second", "name": "b", "command": "y"}
            ]
        }));

        let config = ModelsConfig::load(file.path()).unwrap();
        assert_eq!(config.default_model().unwrap().id, "first");
    }
}
