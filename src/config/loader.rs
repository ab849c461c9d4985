//! Configuration loading and saving utilities.

use crate::config::{ConfigError, HostConfig};
use std::path::PathBuf;

/// Configuration loader/saver
#[derive(Debug, Default)]
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn new() -> Self {
        Self
    }

    pub fn load_from_file(&self, path: &PathBuf) -> Result<HostConfig, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.clone()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: HostConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, config: &HostConfig, path: &PathBuf) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(config)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
