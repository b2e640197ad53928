use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    /// Return a copy with the level replaced, if an override is given.
    pub fn with_level_override(&self, level: Option<&str>) -> Self {
        match level {
            Some(level) => Self {
                level: level.to_string(),
                format: self.format,
            },
            None => self.clone(),
        }
    }
}

/// Load a configuration file in JSON5 format.
pub fn load_config<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    json5::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Load a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}
