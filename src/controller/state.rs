//! Plugin descriptors, runtime records and lifecycle events.

use crate::error::{ErrorRecord, HostError, HostResult};
use crate::permissions::{PermissionRequest, PermissionSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

/// Lifecycle status. `Installing`, `Starting`, `Stopping` and `Updating` are transient;
/// `Blocked` and `Removed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    Installing,
    Stopped,
    Starting,
    Running,
    Stopping,
    Updating,
    Blocked,
    Removed,
}

impl PluginStatus {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PluginStatus::Installing
                | PluginStatus::Starting
                | PluginStatus::Stopping
                | PluginStatus::Updating
        )
    }

    pub fn is_absorbing(&self) -> bool {
        matches!(self, PluginStatus::Blocked | PluginStatus::Removed)
    }

    /// Whether the status implies a live execution handle
    pub fn is_live(&self) -> bool {
        matches!(self, PluginStatus::Running | PluginStatus::Starting)
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginStatus::Installing => "installing",
            PluginStatus::Stopped => "stopped",
            PluginStatus::Starting => "starting",
            PluginStatus::Running => "running",
            PluginStatus::Stopping => "stopping",
            PluginStatus::Updating => "updating",
            PluginStatus::Blocked => "blocked",
            PluginStatus::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// Where a plugin's code comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PluginSource {
    Inline { code: String },
    /// Bundle file read each time the plugin starts
    Bundle { path: PathBuf },
}

impl PluginSource {
    pub async fn load(&self) -> HostResult<String> {
        match self {
            PluginSource::Inline { code } => Ok(code.clone()),
            PluginSource::Bundle { path } => tokio::fs::read_to_string(path).await.map_err(|e| {
                HostError::ExecutionError(format!("reading bundle {}: {}", path.display(), e))
            }),
        }
    }
}

/// Manifest-derived identity of a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub version: semver::Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub source: PluginSource,
    /// Initial permission requests
    #[serde(default)]
    pub permissions: Vec<PermissionRequest>,
}

impl PluginDescriptor {
    pub fn new(id: impl Into<String>, version: semver::Version, source: PluginSource) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version,
            description: None,
            source,
            permissions: Vec::new(),
        }
    }

    pub fn inline(id: impl Into<String>, version: &str, code: impl Into<String>) -> HostResult<Self> {
        let version = semver::Version::parse(version)
            .map_err(|e| HostError::InvalidDescriptor(format!("version {:?}: {}", version, e)))?;
        Ok(Self::new(id, version, PluginSource::Inline { code: code.into() }))
    }

    pub fn with_permission(mut self, request: PermissionRequest) -> Self {
        self.permissions.push(request);
        self
    }

    pub fn validate(&self) -> HostResult<()> {
        if self.id.trim().is_empty() {
            return Err(HostError::InvalidDescriptor("plugin id is empty".to_string()));
        }
        if self.id.chars().any(char::is_whitespace) {
            return Err(HostError::InvalidDescriptor(format!(
                "plugin id {:?} contains whitespace",
                self.id
            )));
        }
        if self.name.trim().is_empty() {
            return Err(HostError::InvalidDescriptor(format!("{}: name is empty", self.id)));
        }

        let mut seen = HashSet::new();
        for request in &self.permissions {
            if request.capability.trim().is_empty() {
                return Err(HostError::InvalidDescriptor(format!(
                    "{}: empty capability name",
                    self.id
                )));
            }
            if !seen.insert(request.capability.as_str()) {
                return Err(HostError::InvalidDescriptor(format!(
                    "{}: duplicate permission {}",
                    self.id, request.capability
                )));
            }
        }
        Ok(())
    }
}

/// Mutable record owned by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRuntimeState {
    pub status: PluginStatus,
    pub granted: PermissionSet,
    /// Requests awaiting explicit host approval
    #[serde(default)]
    pub pending: Vec<PermissionRequest>,
    pub enabled: bool,
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    #[serde(default)]
    pub active_invocations: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorRecord>,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PluginRuntimeState {
    pub fn new(granted: PermissionSet, pending: Vec<PermissionRequest>) -> Self {
        let now = Utc::now();
        Self {
            status: PluginStatus::Installing,
            granted,
            pending,
            enabled: true,
            blocked: false,
            block_reason: None,
            active_invocations: 0,
            last_error: None,
            installed_at: now,
            updated_at: now,
        }
    }

    pub fn record_error(&mut self, error: &HostError) {
        self.last_error = Some(ErrorRecord::from(error));
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Persisted pair of descriptor and runtime record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSnapshot {
    pub descriptor: PluginDescriptor,
    pub state: PluginRuntimeState,
}

impl PluginSnapshot {
    /// Normalize a snapshot read back after a restart: nothing is running
    pub fn restored(mut self) -> Self {
        self.state.status = if self.state.blocked {
            PluginStatus::Blocked
        } else {
            PluginStatus::Stopped
        };
        self.state.active_invocations = 0;
        self
    }
}

/// Lifecycle notifications broadcast by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginEvent {
    Installed { plugin_id: String, version: String },
    Started { plugin_id: String, context_id: String },
    Stopped { plugin_id: String },
    Crashed { plugin_id: String, reason: String },
    Updated { plugin_id: String, from: String, to: String },
    PermissionGranted { plugin_id: String, capability: String },
    PermissionRevoked { plugin_id: String, capability: String },
    Enabled { plugin_id: String },
    Disabled { plugin_id: String },
    Blocked { plugin_id: String, reason: String },
    Uninstalled { plugin_id: String },
}

impl PluginEvent {
    pub fn plugin_id(&self) -> &str {
        match self {
            PluginEvent::Installed { plugin_id, .. }
            | PluginEvent::Started { plugin_id, .. }
            | PluginEvent::Stopped { plugin_id }
            | PluginEvent::Crashed { plugin_id, .. }
            | PluginEvent::Updated { plugin_id, .. }
            | PluginEvent::PermissionGranted { plugin_id, .. }
            | PluginEvent::PermissionRevoked { plugin_id, .. }
            | PluginEvent::Enabled { plugin_id }
            | PluginEvent::Disabled { plugin_id }
            | PluginEvent::Blocked { plugin_id, .. }
            | PluginEvent::Uninstalled { plugin_id } => plugin_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_validation() {
        let ok = PluginDescriptor::inline("npm:hello", "1.0.0", "echo")
            .unwrap()
            .with_permission(PermissionRequest::new("storage"));
        assert!(ok.validate().is_ok());

        let dup = ok.clone().with_permission(PermissionRequest::new("storage"));
        assert!(matches!(dup.validate(), Err(HostError::InvalidDescriptor(_))));

        let blank = PluginDescriptor::inline(" ", "1.0.0", "echo").unwrap();
        assert!(blank.validate().is_err());

        assert!(PluginDescriptor::inline("npm:hello", "one", "echo").is_err());
    }

    #[test]
    fn test_restored_snapshot_is_never_running() {
        let descriptor = PluginDescriptor::inline("p", "0.1.0", "echo").unwrap();
        let mut state = PluginRuntimeState::new(PermissionSet::new(), Vec::new());
        state.status = PluginStatus::Running;
        state.active_invocations = 3;

        let restored = PluginSnapshot {
            descriptor: descriptor.clone(),
            state: state.clone(),
        }
        .restored();
        assert_eq!(restored.state.status, PluginStatus::Stopped);
        assert_eq!(restored.state.active_invocations, 0);

        state.blocked = true;
        let blocked = PluginSnapshot { descriptor, state }.restored();
        assert_eq!(blocked.state.status, PluginStatus::Blocked);
    }

    #[test]
    fn test_status_classes() {
        assert!(PluginStatus::Updating.is_transient());
        assert!(PluginStatus::Removed.is_absorbing());
        assert!(!PluginStatus::Stopped.is_live());
        assert_eq!(PluginStatus::Stopping.to_string(), "stopping");
    }

    #[tokio::test]
    async fn test_bundle_source_reads_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("bundle.js");
        std::fs::write(&path, "echo").unwrap();

        let source = PluginSource::Bundle { path: path.clone() };
        assert_eq!(source.load().await.unwrap(), "echo");

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(source.load().await, Err(HostError::ExecutionError(_))));
    }
}
