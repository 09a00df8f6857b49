use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The subset of an OCI image configuration used to derive the container process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageConfig {
    #[serde(default)]
    pub config: ImageProcessConfig,
}

/// `config` object of an OCI image configuration. Field names follow the
/// image spec, which uses Go-style capitalized keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ImageProcessConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
}

impl ImageConfig {
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(input).map_err(ConfigError::ImageConfig)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&content)
    }

    pub fn env(&self) -> &[String] {
        &self.config.env
    }

    pub fn entrypoint(&self) -> &[String] {
        &self.config.entrypoint
    }

    pub fn cmd(&self) -> &[String] {
        &self.config.cmd
    }
}
