//! Persistence of plugin snapshots.
//!
//! The whole state is one JSON document `{ version, plugins: { id: {descriptor, state} } }`.
//! [`JsonFileStore`] rewrites it through a temporary file and a rename so a crash
//! mid-write never leaves a torn file behind.

use super::state::PluginSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginSnapshot>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<StateSnapshot, StoreError>;

    async fn save_plugin(&self, snapshot: &PluginSnapshot) -> Result<(), StoreError>;

    async fn remove_plugin(&self, plugin_id: &str) -> Result<(), StoreError>;
}

/// Keeps snapshots in memory only
#[derive(Debug, Default)]
pub struct MemoryStore {
    plugins: Mutex<BTreeMap<String, PluginSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<StateSnapshot, StoreError> {
        Ok(StateSnapshot {
            version: SNAPSHOT_VERSION,
            plugins: self.plugins.lock().await.clone(),
        })
    }

    async fn save_plugin(&self, snapshot: &PluginSnapshot) -> Result<(), StoreError> {
        self.plugins
            .lock()
            .await
            .insert(snapshot.descriptor.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn remove_plugin(&self, plugin_id: &str) -> Result<(), StoreError> {
        self.plugins.lock().await.remove(plugin_id);
        Ok(())
    }
}

/// One JSON file holding every plugin's snapshot
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    cache: Mutex<Option<StateSnapshot>>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<StateSnapshot, StoreError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StateSnapshot {
                    version: SNAPSHOT_VERSION,
                    plugins: BTreeMap::new(),
                })
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let snapshot: StateSnapshot = serde_json::from_slice(&raw)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::UnsupportedVersion(snapshot.version));
        }
        Ok(snapshot)
    }

    async fn write_file(&self, snapshot: &StateSnapshot) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let body = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        debug!(path = %self.path.display(), plugins = snapshot.plugins.len(), "state written");
        Ok(())
    }

    /// Apply `change` to the cached snapshot and write the result through
    async fn update<F>(&self, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StateSnapshot) + Send,
    {
        let mut cache = self.cache.lock().await;
        let mut snapshot = match cache.take() {
            Some(snapshot) => snapshot,
            None => self.read_file().await?,
        };
        change(&mut snapshot);
        let written = self.write_file(&snapshot).await;
        *cache = Some(snapshot);
        written
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> Result<StateSnapshot, StoreError> {
        let snapshot = self.read_file().await?;
        *self.cache.lock().await = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn save_plugin(&self, snapshot: &PluginSnapshot) -> Result<(), StoreError> {
        let snapshot = snapshot.clone();
        self.update(move |state| {
            state.plugins.insert(snapshot.descriptor.id.clone(), snapshot);
        })
        .await
    }

    async fn remove_plugin(&self, plugin_id: &str) -> Result<(), StoreError> {
        let plugin_id = plugin_id.to_string();
        self.update(move |state| {
            state.plugins.remove(&plugin_id);
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::state::{PluginDescriptor, PluginRuntimeState, PluginStatus};
    use crate::permissions::PermissionSet;
    use tempfile::TempDir;

    fn snapshot(id: &str) -> PluginSnapshot {
        let mut state = PluginRuntimeState::new(PermissionSet::new(), Vec::new());
        state.status = PluginStatus::Stopped;
        PluginSnapshot {
            descriptor: PluginDescriptor::inline(id, "1.2.3", "echo").unwrap(),
            state,
        }
    }

    #[tokio::test]
    async fn test_json_store_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state").join("plugins.json");

        let store = JsonFileStore::new(&path);
        store.save_plugin(&snapshot("a")).await.unwrap();
        store.save_plugin(&snapshot("b")).await.unwrap();
        store.remove_plugin("a").await.unwrap();

        let reopened = JsonFileStore::new(&path);
        let loaded = reopened.load().await.unwrap();
        assert_eq!(loaded.plugins.len(), 1);
        assert_eq!(loaded.plugins["b"], snapshot_with_times(&loaded, "b"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    fn snapshot_with_times(loaded: &StateSnapshot, id: &str) -> PluginSnapshot {
        // Timestamps are generated per call; compare the rest of the record.
        let mut expected = snapshot(id);
        expected.state.installed_at = loaded.plugins[id].state.installed_at;
        expected.state.updated_at = loaded.plugins[id].state.updated_at;
        expected
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let temp = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp.path().join("absent.json"));
        let loaded = store.load().await.unwrap();
        assert!(loaded.plugins.is_empty());
        assert_eq!(loaded.version, SNAPSHOT_VERSION);
    }

    #[tokio::test]
    async fn test_unknown_version_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");
        std::fs::write(&path, r#"{"version": 99, "plugins": {}}"#).unwrap();
        assert!(matches!(
            JsonFileStore::new(&path).load().await,
            Err(StoreError::UnsupportedVersion(99))
        ));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        store.save_plugin(&snapshot("a")).await.unwrap();
        assert_eq!(store.load().await.unwrap().plugins.len(), 1);
        store.remove_plugin("a").await.unwrap();
        assert!(store.load().await.unwrap().plugins.is_empty());
    }
}
