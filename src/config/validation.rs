//! Configuration validation utilities.

use crate::config::{AdapterConfig, ConfigError, HostConfig};
use std::collections::HashSet;

/// Configuration validator
pub struct ConfigValidator {
    valid_log_levels: HashSet<&'static str>,
}

impl ConfigValidator {
    pub fn new() -> Self {
        Self {
            valid_log_levels: ["trace", "debug", "info", "warn", "error", "off"]
                .into_iter()
                .collect(),
        }
    }

    pub fn validate(&self, config: &HostConfig) -> Result<(), ConfigError> {
        self.validate_execution(config)?;
        self.validate_permissions(config)?;
        self.validate_logging(config)?;
        Ok(())
    }

    fn validate_execution(&self, config: &HostConfig) -> Result<(), ConfigError> {
        let execution = &config.execution;

        for (field, value) in [
            ("default_timeout_ms", execution.default_timeout_ms),
            ("init_timeout_ms", execution.init_timeout_ms),
            ("health_check_interval_ms", execution.health_check_interval_ms),
            ("ping_timeout_ms", execution.ping_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "execution.{} must be greater than zero",
                    field
                )));
            }
        }

        if execution.max_contexts == 0 {
            return Err(ConfigError::ValidationError(
                "execution.max_contexts must be greater than zero".to_string(),
            ));
        }

        // Frame length prefixes are u32 and names are capped at 255 bytes.
        if execution.max_frame_payload < 256 || execution.max_frame_payload > u32::MAX as usize {
            return Err(ConfigError::ValidationError(format!(
                "execution.max_frame_payload out of range: {}",
                execution.max_frame_payload
            )));
        }

        if let AdapterConfig::Process { command, .. } = &execution.adapter {
            if command.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "execution.adapter.command must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn validate_permissions(&self, config: &HostConfig) -> Result<(), ConfigError> {
        let auto: HashSet<&String> = config.permissions.auto_approve.iter().collect();
        if let Some(conflict) = config.permissions.deny.iter().find(|name| auto.contains(name)) {
            return Err(ConfigError::ValidationError(format!(
                "capability '{}' is both auto-approved and denied",
                conflict
            )));
        }
        Ok(())
    }

    fn validate_logging(&self, config: &HostConfig) -> Result<(), ConfigError> {
        // Directive lists like `info,plughost=debug` are accepted as-is.
        let level = config.logging.level.trim();
        if !level.contains('=') && !level.contains(',') && !self.valid_log_levels.contains(level) {
            return Err(ConfigError::ValidationError(format!(
                "unknown log level '{}'",
                config.logging.level
            )));
        }
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}
