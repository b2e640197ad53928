//! Host configuration: where the settings file lives and where output goes.
//!
//! The device-facing settings (transport, groups, period) come from the
//! line-oriented settings file, see [`crate::settings`]. This file only covers
//! process plumbing and is JSON5:
//!
//! ```json5
//! {
//!     settings_file: "settings.ini",
//!     output_dir: "results",
//!     fault_log: "modbus-master.log",
//!     register_kind: "holding",
//!     logging: { level: "info", format: "text" },
//! }
//! ```

use crate::transport::RegisterKind;
use modbus_master_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Load(#[from] modbus_master_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Path to the line-oriented settings file
    #[serde(default = "default_settings_file")]
    pub settings_file: PathBuf,

    /// Directory receiving the daily CSV result files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Fault log file
    #[serde(default = "default_fault_log")]
    pub fault_log: PathBuf,

    /// Register table to read
    #[serde(default)]
    pub register_kind: RegisterKind,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_settings_file() -> PathBuf {
    PathBuf::from("settings.ini")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_fault_log() -> PathBuf {
    PathBuf::from("modbus-master.log")
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            settings_file: default_settings_file(),
            output_dir: default_output_dir(),
            fault_log: default_fault_log(),
            register_kind: RegisterKind::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl HostConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: HostConfig = modbus_master_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, path) in [
            ("settings_file", &self.settings_file),
            ("output_dir", &self.output_dir),
            ("fault_log", &self.fault_log),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Validation(format!("{} cannot be empty", name)));
            }
        }

        if self.output_dir.is_file() {
            return Err(ConfigError::Validation(format!(
                "output_dir '{}' is a file",
                self.output_dir.display()
            )));
        }

        Ok(())
    }
}
