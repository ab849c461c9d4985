//! Structured logging setup.
//!
//! All components log through `tracing`; this module installs the global subscriber
//! from [`LogConfig`]. Plugin console output is re-emitted under the `plugin_console`
//! target so it can be filtered separately.

use crate::config::{LogConfig, LogFormat};
use tracing_subscriber::EnvFilter;

/// Target used for lines a sandbox writes to its console channel
pub const PLUGIN_CONSOLE_TARGET: &str = "plugin_console";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid log filter '{directive}': {reason}")]
    InvalidFilter { directive: String, reason: String },

    #[error("Global subscriber already installed: {0}")]
    AlreadyInitialized(String),
}

/// Build the env filter, letting `RUST_LOG` override the configured level
pub fn build_filter(config: &LogConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| LoggingError::InvalidFilter {
        directive: config.level.clone(),
        reason: e.to_string(),
    })
}

/// Install the global tracing subscriber
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    let filter = build_filter(config)?;

    let result = match config.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(config.ansi)
            .with_target(true)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init(),
    };

    result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_is_rejected() {
        let config = LogConfig {
            level: "plughost=notalevel".to_string(),
            ..LogConfig::default()
        };
        if std::env::var("RUST_LOG").is_err() {
            assert!(matches!(
                build_filter(&config),
                Err(LoggingError::InvalidFilter { .. })
            ));
        }
    }

    #[test]
    fn test_second_init_reports_already_initialized() {
        let config = LogConfig::default();
        let _ = init_logging(&config);
        assert!(matches!(
            init_logging(&config),
            Err(LoggingError::AlreadyInitialized(_))
        ));
    }
}
