//! Modbus Master Common Library
//!
//! Host plumbing shared by the Modbus master binary and its tests:
//!
//! - [`config`] - Host configuration loading (JSON5 format) and logging settings
//! - [`error`] - Error types

pub mod config;
pub mod error;

pub use config::{LogFormat, LoggingConfig, load_config, parse_config};
pub use error::{Error, Result};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// `RUST_LOG` takes precedence over the configured level when set.
///
/// # Example
///
/// ```ignore
/// use modbus_master_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Tracing(e.to_string()))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Tracing(e.to_string()))?;
        }
    }

    Ok(())
}
