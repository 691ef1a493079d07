//! Telemetry account settings read from a JSON file.

use serde::Deserialize;
use std::path::Path;

/// Credentials and target device on the telemetry endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    pub username: String,
    pub password: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub baseurl: String,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, error::ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| error::ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(s: &str) -> Result<Self, error::ConfigError> {
        Ok(serde_json::from_str(s)?)
    }
}

pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum ConfigError {
        #[error("Cannot read config file {path}: {source}")]
        Read {
            path: String,
            source: std::io::Error,
        },
        #[error("Malformed config: {0}")]
        Parse(#[from] serde_json::Error),
    }
}
