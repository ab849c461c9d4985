//! Child-process adapter.
//!
//! Each context gets its own directory under `sandbox_dir`. `load_code` writes the bundle
//! and the endowment manifest there and spawns the worker with a scrubbed environment;
//! the worker speaks the host protocol on stdin/stdout and may log on stderr.

use super::adapter::{AdapterError, AdapterKind, ContextId, CrashNotice, ExecutionContextAdapter};
use super::endowments::Endowments;
use crate::mux::ByteStream;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const BUNDLE_FILE: &str = "plugin.bundle";
pub const ENDOWMENTS_FILE: &str = "endowments.json";

struct ProcessEntry {
    dir: PathBuf,
    stdio: Option<(ChildStdin, ChildStdout)>,
    /// Cancelled by `destroy`; the watcher kills the child instead of reporting a crash
    stop: CancellationToken,
    spawned: bool,
}

pub struct ProcessAdapter {
    command: String,
    args: Vec<String>,
    sandbox_dir: PathBuf,
    max_contexts: usize,
    contexts: Arc<Mutex<HashMap<ContextId, ProcessEntry>>>,
    crashes: broadcast::Sender<CrashNotice>,
}

impl ProcessAdapter {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        sandbox_dir: impl Into<PathBuf>,
        max_contexts: usize,
    ) -> Self {
        let (crashes, _) = broadcast::channel(64);
        Self {
            command: command.into(),
            args,
            sandbox_dir: sandbox_dir.into(),
            max_contexts,
            contexts: Arc::new(Mutex::new(HashMap::new())),
            crashes,
        }
    }

    /// Directory backing a context, if it is still alive
    pub async fn context_dir(&self, id: ContextId) -> Option<PathBuf> {
        self.contexts.lock().await.get(&id).map(|entry| entry.dir.clone())
    }
}

#[async_trait]
impl ExecutionContextAdapter for ProcessAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Process
    }

    async fn create(&self) -> Result<ContextId, AdapterError> {
        let mut contexts = self.contexts.lock().await;
        if contexts.len() >= self.max_contexts {
            return Err(AdapterError::QuotaExceeded(self.max_contexts));
        }

        let id = ContextId::new();
        let dir = self.sandbox_dir.join(id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AdapterError::Allocation(format!("{}: {}", dir.display(), e)))?;

        contexts.insert(
            id,
            ProcessEntry {
                dir,
                stdio: None,
                stop: CancellationToken::new(),
                spawned: false,
            },
        );
        debug!(context_id = %id, "created process context");
        Ok(id)
    }

    async fn load_code(
        &self,
        id: ContextId,
        code: &str,
        endowments: &Endowments,
    ) -> Result<(), AdapterError> {
        let mut contexts = self.contexts.lock().await;
        let entry = contexts.get_mut(&id).ok_or(AdapterError::UnknownContext(id))?;
        if entry.spawned {
            return Err(AdapterError::CodeRejected("code already loaded".to_string()));
        }

        let bundle = entry.dir.join(BUNDLE_FILE);
        let manifest = entry.dir.join(ENDOWMENTS_FILE);
        tokio::fs::write(&bundle, code)
            .await
            .map_err(|e| AdapterError::Allocation(format!("writing bundle: {}", e)))?;
        let manifest_json = serde_json::to_vec_pretty(endowments)
            .map_err(|e| AdapterError::Allocation(format!("encoding endowments: {}", e)))?;
        tokio::fs::write(&manifest, manifest_json)
            .await
            .map_err(|e| AdapterError::Allocation(format!("writing endowments: {}", e)))?;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(&entry.dir)
            .env_clear()
            .env("PATH", std::env::var_os("PATH").unwrap_or_default())
            .env("PLUGHOST_BUNDLE", &bundle)
            .env("PLUGHOST_ENDOWMENTS", &manifest)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AdapterError::CodeRejected(format!("failed to spawn {}: {}", self.command, e)))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.start_kill();
            return Err(AdapterError::Stream("worker stdio not captured".to_string()));
        };
        entry.stdio = Some((stdin, stdout));
        entry.spawned = true;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(context_id = %id, "worker stderr: {}", line);
                }
            });
        }

        let stop = entry.stop.clone();
        let crashes = self.crashes.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(context_id = %id, "failed to kill worker: {}", e);
                    }
                }
                status = child.wait() => {
                    if stop.is_cancelled() {
                        return;
                    }
                    let reason = match status {
                        Ok(status) => format!("worker exited with {}", status),
                        Err(e) => format!("worker wait failed: {}", e),
                    };
                    warn!(context_id = %id, reason = %reason, "process context crashed");
                    let _ = crashes.send(CrashNotice { context_id: id, reason });
                }
            }
        });

        info!(context_id = %id, command = %self.command, "spawned worker process");
        Ok(())
    }

    async fn open_stream(&self, id: ContextId) -> Result<ByteStream, AdapterError> {
        let mut contexts = self.contexts.lock().await;
        let entry = contexts.get_mut(&id).ok_or(AdapterError::UnknownContext(id))?;
        let (stdin, stdout) = entry
            .stdio
            .take()
            .ok_or_else(|| AdapterError::Stream(format!("stream for {} unavailable", id)))?;
        Ok(ByteStream::new(stdout, stdin))
    }

    async fn destroy(&self, id: ContextId) -> Result<(), AdapterError> {
        let entry = self
            .contexts
            .lock()
            .await
            .remove(&id)
            .ok_or(AdapterError::UnknownContext(id))?;
        entry.stop.cancel();

        if let Err(e) = tokio::fs::remove_dir_all(&entry.dir).await {
            return Err(AdapterError::Teardown(format!(
                "removing {}: {}",
                entry.dir.display(),
                e
            )));
        }
        debug!(context_id = %id, "destroyed process context");
        Ok(())
    }

    fn subscribe_crashes(&self) -> broadcast::Receiver<CrashNotice> {
        self.crashes.subscribe()
    }
}

impl std::fmt::Debug for ProcessAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessAdapter")
            .field("command", &self.command)
            .field("sandbox_dir", &self.sandbox_dir)
            .field("max_contexts", &self.max_contexts)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn adapter(temp: &TempDir, command: &str, args: &[&str]) -> ProcessAdapter {
        ProcessAdapter::new(
            command,
            args.iter().map(|s| s.to_string()).collect(),
            temp.path().join("sandboxes"),
            2,
        )
    }

    #[tokio::test]
    async fn test_load_writes_bundle_into_sandbox_dir() {
        let temp = TempDir::new().unwrap();
        let adapter = adapter(&temp, "cat", &[]);
        let id = adapter.create().await.unwrap();
        adapter.load_code(id, "module.exports = 1", &Endowments::default()).await.unwrap();

        let dir = adapter.context_dir(id).await.unwrap();
        let bundle = std::fs::read_to_string(dir.join(BUNDLE_FILE)).unwrap();
        assert_eq!(bundle, "module.exports = 1");
        assert!(dir.join(ENDOWMENTS_FILE).exists());

        assert!(adapter.open_stream(id).await.is_ok());
        adapter.destroy(id).await.unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_unrequested_exit_is_a_crash() {
        let temp = TempDir::new().unwrap();
        let adapter = adapter(&temp, "sh", &["-c", "exit 3"]);
        let mut crashes = adapter.subscribe_crashes();
        let id = adapter.create().await.unwrap();
        adapter.load_code(id, "", &Endowments::default()).await.unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(5), crashes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.context_id, id);
        assert!(notice.reason.contains("exited"));
    }

    #[tokio::test]
    async fn test_destroy_does_not_report_crash() {
        let temp = TempDir::new().unwrap();
        let adapter = adapter(&temp, "cat", &[]);
        let mut crashes = adapter.subscribe_crashes();
        let id = adapter.create().await.unwrap();
        adapter.load_code(id, "", &Endowments::default()).await.unwrap();
        adapter.destroy(id).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_millis(300), crashes.recv()).await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn test_missing_command_is_rejected_and_quota_holds() {
        let temp = TempDir::new().unwrap();
        let adapter = adapter(&temp, "definitely-not-a-real-worker", &[]);
        let id = adapter.create().await.unwrap();
        assert!(matches!(
            adapter.load_code(id, "", &Endowments::default()).await,
            Err(AdapterError::CodeRejected(_))
        ));

        let _second = adapter.create().await.unwrap();
        assert!(matches!(adapter.create().await, Err(AdapterError::QuotaExceeded(2))));
    }
}
