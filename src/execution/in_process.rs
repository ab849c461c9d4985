//! In-process adapter: every context is a tokio task running the guest runtime,
//! connected to the host through an in-memory duplex pipe.

use super::adapter::{AdapterError, AdapterKind, ContextId, CrashNotice, ExecutionContextAdapter};
use super::endowments::Endowments;
use super::guest::{GuestRuntime, ProgramLoader};
use crate::config::ExecutionConfig;
use crate::mux::ByteStream;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Default)]
struct ContextEntry {
    host_end: Option<DuplexStream>,
    task: Option<AbortHandle>,
    shutdown: CancellationToken,
}

pub struct InProcessAdapter {
    loader: Arc<dyn ProgramLoader>,
    contexts: Arc<Mutex<HashMap<ContextId, ContextEntry>>>,
    crashes: broadcast::Sender<CrashNotice>,
    max_contexts: usize,
    max_payload: usize,
    max_violations: u32,
}

impl InProcessAdapter {
    pub fn new(loader: Arc<dyn ProgramLoader>, config: &ExecutionConfig) -> Self {
        let (crashes, _) = broadcast::channel(64);
        Self {
            loader,
            contexts: Arc::new(Mutex::new(HashMap::new())),
            crashes,
            max_contexts: config.max_contexts,
            max_payload: config.max_frame_payload,
            max_violations: config.max_protocol_violations,
        }
    }

    /// Kill a context's guest task as if the sandbox had died on its own
    pub async fn inject_crash(&self, id: ContextId) -> Result<(), AdapterError> {
        let contexts = self.contexts.lock().await;
        let entry = contexts.get(&id).ok_or(AdapterError::UnknownContext(id))?;
        match &entry.task {
            Some(task) => {
                warn!(context_id = %id, "injecting crash");
                task.abort();
                Ok(())
            }
            None => Err(AdapterError::Stream(format!("context {} has no running code", id))),
        }
    }

    pub async fn context_count(&self) -> usize {
        self.contexts.lock().await.len()
    }
}

#[async_trait]
impl ExecutionContextAdapter for InProcessAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::InProcess
    }

    async fn create(&self) -> Result<ContextId, AdapterError> {
        let mut contexts = self.contexts.lock().await;
        if contexts.len() >= self.max_contexts {
            return Err(AdapterError::QuotaExceeded(self.max_contexts));
        }
        let id = ContextId::new();
        contexts.insert(id, ContextEntry::default());
        debug!(context_id = %id, "created in-process context");
        Ok(id)
    }

    async fn load_code(
        &self,
        id: ContextId,
        code: &str,
        endowments: &Endowments,
    ) -> Result<(), AdapterError> {
        let shutdown = {
            let contexts = self.contexts.lock().await;
            let entry = contexts.get(&id).ok_or(AdapterError::UnknownContext(id))?;
            if entry.task.is_some() {
                return Err(AdapterError::CodeRejected("code already loaded".to_string()));
            }
            entry.shutdown.clone()
        };

        let program = self.loader.load(code).map_err(AdapterError::CodeRejected)?;
        program
            .initialize(endowments)
            .await
            .map_err(AdapterError::CodeRejected)?;

        let (host_end, guest_end) = tokio::io::duplex(PIPE_CAPACITY);
        let runtime = GuestRuntime::new(program, endowments.clone())
            .with_limits(self.max_payload, self.max_violations);
        let task = tokio::spawn(runtime.run(ByteStream::from_duplex(guest_end), shutdown.clone()));

        {
            let mut contexts = self.contexts.lock().await;
            let Some(entry) = contexts.get_mut(&id) else {
                task.abort();
                return Err(AdapterError::UnknownContext(id));
            };
            entry.host_end = Some(host_end);
            entry.task = Some(task.abort_handle());
        }

        // Any exit that `destroy` did not ask for is a crash.
        let crashes = self.crashes.clone();
        tokio::spawn(async move {
            let outcome = task.await;
            if shutdown.is_cancelled() {
                return;
            }
            let reason = match outcome {
                Ok(Ok(())) => "guest runtime exited".to_string(),
                Ok(Err(e)) => format!("guest runtime failed: {}", e),
                Err(e) if e.is_panic() => "guest runtime panicked".to_string(),
                Err(_) => "guest task terminated".to_string(),
            };
            warn!(context_id = %id, reason = %reason, "in-process context crashed");
            let _ = crashes.send(CrashNotice {
                context_id: id,
                reason,
            });
        });

        info!(context_id = %id, endowments = endowments.len(), "loaded code into in-process context");
        Ok(())
    }

    async fn open_stream(&self, id: ContextId) -> Result<ByteStream, AdapterError> {
        let mut contexts = self.contexts.lock().await;
        let entry = contexts.get_mut(&id).ok_or(AdapterError::UnknownContext(id))?;
        let host_end = entry
            .host_end
            .take()
            .ok_or_else(|| AdapterError::Stream(format!("stream for {} already taken", id)))?;
        Ok(ByteStream::from_duplex(host_end))
    }

    async fn destroy(&self, id: ContextId) -> Result<(), AdapterError> {
        let entry = self
            .contexts
            .lock()
            .await
            .remove(&id)
            .ok_or(AdapterError::UnknownContext(id))?;
        entry.shutdown.cancel();
        if let Some(task) = entry.task {
            task.abort();
        }
        debug!(context_id = %id, "destroyed in-process context");
        Ok(())
    }

    fn subscribe_crashes(&self) -> broadcast::Receiver<CrashNotice> {
        self.crashes.subscribe()
    }
}

impl std::fmt::Debug for InProcessAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessAdapter")
            .field("max_contexts", &self.max_contexts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::guest::{GuestContext, GuestRequest, PluginProgram};
    use crate::rpc::RpcErrorObject;
    use serde_json::Value;
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl PluginProgram for Noop {
        async fn handle(&self, _ctx: &GuestContext, _request: GuestRequest) -> Result<Value, RpcErrorObject> {
            Ok(Value::Null)
        }
    }

    struct Loader;

    impl ProgramLoader for Loader {
        fn load(&self, source: &str) -> Result<Arc<dyn PluginProgram>, String> {
            if source.contains("syntax error") {
                Err(format!("SyntaxError: unexpected token in {:?}", source))
            } else {
                Ok(Arc::new(Noop))
            }
        }
    }

    fn adapter(max_contexts: usize) -> InProcessAdapter {
        let config = ExecutionConfig {
            max_contexts,
            ..ExecutionConfig::default()
        };
        InProcessAdapter::new(Arc::new(Loader), &config)
    }

    #[tokio::test]
    async fn test_quota_is_enforced() {
        let adapter = adapter(1);
        let first = adapter.create().await.unwrap();
        assert!(matches!(adapter.create().await, Err(AdapterError::QuotaExceeded(1))));
        adapter.destroy(first).await.unwrap();
        assert!(adapter.create().await.is_ok());
    }

    #[tokio::test]
    async fn test_rejected_code_reports_detail() {
        let adapter = adapter(4);
        let id = adapter.create().await.unwrap();
        match adapter.load_code(id, "syntax error here", &Endowments::default()).await {
            Err(AdapterError::CodeRejected(detail)) => assert!(detail.contains("SyntaxError")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_taken_once() {
        let adapter = adapter(4);
        let id = adapter.create().await.unwrap();
        adapter.load_code(id, "ok", &Endowments::default()).await.unwrap();
        assert!(adapter.open_stream(id).await.is_ok());
        assert!(matches!(adapter.open_stream(id).await, Err(AdapterError::Stream(_))));
    }

    #[tokio::test]
    async fn test_injected_crash_is_broadcast_but_destroy_is_not() {
        let adapter = adapter(4);
        let mut crashes = adapter.subscribe_crashes();

        let quiet = adapter.create().await.unwrap();
        adapter.load_code(quiet, "ok", &Endowments::default()).await.unwrap();
        adapter.destroy(quiet).await.unwrap();

        let doomed = adapter.create().await.unwrap();
        adapter.load_code(doomed, "ok", &Endowments::default()).await.unwrap();
        adapter.inject_crash(doomed).await.unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(1), crashes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.context_id, doomed);
        assert_eq!(adapter.context_count().await, 1);
    }
}
