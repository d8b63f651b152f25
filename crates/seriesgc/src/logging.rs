//! Structured logging for seriesgc.
//!
//! Built on `tracing` with configurable output format. Initialize once at
//! startup:
//!
//! ```ignore
//! use seriesgc::logging::{LogConfig, LogFormat, init_logging};
//!
//! init_logging(&LogConfig { level: "info".into(), format: LogFormat::Pretty })?;
//! ```
//!
//! Correlation fields used consistently across spans and events:
//! - `worker`: ingest worker / cache identifier
//! - `series`: series identifier
//! - `current`, `delete`, `epoch`: epoch values
//! - `phase`: garbage-collector phase name

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt};

/// Global flag to track if logging has been initialized.
static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use.
    #[default]
    Pretty,
    /// Machine-parseable JSON lines for CI/ops.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error). Can be
    /// overridden by the `RUST_LOG` environment variable.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

/// Error type for logging initialization.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Initialize the global tracing subscriber.
///
/// Safe to call once per process; subsequent calls return
/// [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| LogError::InvalidFilter(e.to_string()))?;

    match config.format {
        LogFormat::Pretty => {
            let subscriber = fmt()
                .with_env_filter(filter)
                .with_target(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Json => {
            let subscriber = fmt()
                .with_env_filter(filter)
                .json()
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    let _ = LOGGING_INITIALIZED.set(true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_serde_round_trip() {
        let json = serde_json::to_string(&LogFormat::Json).unwrap();
        assert_eq!(json, "\"json\"");
        let back: LogFormat = serde_json::from_str(&json).unwrap();
        assert_eq!(back, LogFormat::Json);
    }

    #[test]
    fn default_config_is_info_pretty() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Pretty);
    }
}
