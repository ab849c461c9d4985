//! Configuration management for the plugin host.
//!
//! Covers execution limits, permission auto-approval, state persistence and logging.
//! Every section has serde defaults so a partial TOML file is enough.

pub mod loader;
pub mod validation;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub execution: ExecutionConfig,
    pub permissions: PermissionConfig,
    pub persistence: PersistenceConfig,
    pub logging: LogConfig,
}

/// Execution service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Per-request timeout applied to `invoke` when no narrower bound exists
    pub default_timeout_ms: u64,
    /// Bound on the post-load handshake with a fresh context
    pub init_timeout_ms: u64,
    /// Health monitor tick
    pub health_check_interval_ms: u64,
    /// Contexts idle for longer than this are pinged by the monitor
    pub idle_ping_after_ms: u64,
    pub ping_timeout_ms: u64,
    /// Maximum number of live contexts per adapter
    pub max_contexts: usize,
    /// Violations tolerated on one connection before it is treated as crashed
    pub max_protocol_violations: u32,
    /// Largest payload carried by a single multiplexer frame
    pub max_frame_payload: usize,
    pub adapter: AdapterConfig,
}

/// Which isolation backend the execution service drives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterConfig {
    InProcess,
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        sandbox_dir: PathBuf,
    },
}

/// Permission approval settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Capabilities granted without asking the host
    pub auto_approve: Vec<String>,
    /// Capabilities that are never granted
    pub deny: Vec<String>,
}

/// Runtime state persistence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub state_path: PathBuf,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `plughost=debug`
    pub level: String,
    pub format: LogFormat,
    pub ansi: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Errors that can occur during configuration operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Validation failed: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),
}

impl HostConfig {
    /// Load and validate a configuration file
    pub fn load(path: &PathBuf) -> Result<Self, ConfigError> {
        let config = loader::ConfigLoader::new().load_from_file(path)?;
        validation::ConfigValidator::new().validate(&config)?;
        Ok(config)
    }

    /// Save configuration to file, creating parent directories
    pub fn save(&self, path: &PathBuf) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        loader::ConfigLoader::new().save_to_file(self, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validation::ConfigValidator::new().validate(self)
    }
}

impl ExecutionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn idle_ping_after(&self) -> Duration {
        Duration::from_millis(self.idle_ping_after_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 60_000,
            init_timeout_ms: 10_000,
            health_check_interval_ms: 5_000,
            idle_ping_after_ms: 30_000,
            ping_timeout_ms: 5_000,
            max_contexts: 64,
            max_protocol_violations: 16,
            max_frame_payload: 64 * 1024,
            adapter: AdapterConfig::InProcess,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        let state_path = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("plughost")
            .join("state.json");

        Self {
            enabled: true,
            state_path,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            ansi: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = HostConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.execution.default_timeout(), Duration::from_secs(60));
        assert_eq!(config.execution.adapter, AdapterConfig::InProcess);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let raw = r#"
            [execution]
            default_timeout_ms = 250

            [permissions]
            auto_approve = ["endowment:rpc", "storage"]
        "#;
        let config: HostConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.execution.default_timeout_ms, 250);
        assert_eq!(config.execution.max_contexts, 64);
        assert_eq!(config.permissions.auto_approve.len(), 2);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("host.toml");

        let mut config = HostConfig::default();
        config.execution.adapter = AdapterConfig::Process {
            command: "plugin-worker".to_string(),
            args: vec!["--stdio".to_string()],
            sandbox_dir: temp_dir.path().join("sandbox"),
        };
        config.logging.format = LogFormat::Json;

        config.save(&path).unwrap();
        let loaded = HostConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let result = HostConfig::load(&temp_dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }
}
