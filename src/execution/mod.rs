//! Execution Service
//!
//! Owns one [`ExecutionHandle`] per running plugin. It drives the configured
//! [`ExecutionContextAdapter`], connects to each context through a multiplexer carrying
//! the `control`, `rpc` and `console` channels, relays requests with timeouts and
//! cancellation, and reports contexts that die or stop answering as [`CrashEvent`]s.
//!
//! The service never changes plugin status itself; the controller reacts to crash
//! events and calls [`ExecutionService::destroy_context`].

pub mod adapter;
pub mod endowments;
pub mod guest;
pub mod in_process;
pub mod process;

pub use adapter::{AdapterError, AdapterKind, ContextId, CrashNotice, ExecutionContextAdapter};
pub use endowments::{Endowment, Endowments};
pub use guest::{GuestContext, GuestRequest, GuestRuntime, PluginProgram, ProgramLoader};
pub use in_process::InProcessAdapter;
pub use process::ProcessAdapter;

use crate::config::ExecutionConfig;
use crate::error::{HostError, HostResult};
use crate::logging::PLUGIN_CONSOLE_TARGET;
use crate::mux::{MuxChannel, MuxError, Multiplexer, ViolationTracker};
use crate::permissions::PermissionSet;
use crate::rpc::{codes, BusyGuard, InboundHandler, RequestId, RpcChannel, RpcError, RpcErrorObject};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const CONTROL_CHANNEL: &str = "control";
pub const RPC_CHANNEL: &str = "rpc";
pub const CONSOLE_CHANNEL: &str = "console";

pub const PING_METHOD: &str = "ping";
pub const INVOKE_METHOD: &str = "invoke";

/// Serves calls made by plugin code into the host
#[async_trait]
pub trait HostCallRouter: Send + Sync {
    async fn route(&self, plugin_id: &str, method: &str, params: Value) -> Result<Value, RpcErrorObject>;
}

struct HostCallInbound {
    plugin_id: String,
    router: Arc<dyn HostCallRouter>,
}

#[async_trait]
impl InboundHandler for HostCallInbound {
    async fn handle_request(
        &self,
        _id: &RequestId,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcErrorObject> {
        self.router.route(&self.plugin_id, method, params).await
    }
}

/// A context ended without being destroyed, or stopped answering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashEvent {
    pub plugin_id: String,
    pub context_id: ContextId,
    pub reason: String,
}

struct Connection {
    mux: Multiplexer,
    control: RpcChannel,
    rpc: RpcChannel,
}

impl Connection {
    /// Why the connection can no longer carry traffic, if it cannot
    fn lost(&self) -> Option<&'static str> {
        if self.mux.is_closed() {
            Some("transport closed")
        } else if self.rpc.is_closed() {
            Some("rpc channel closed")
        } else if self.control.is_closed() {
            Some("control channel closed")
        } else {
            None
        }
    }
}

/// One live context
pub struct ExecutionHandle {
    plugin_id: String,
    context_id: ContextId,
    connection: OnceLock<Connection>,
    busy: Arc<AtomicUsize>,
    last_activity: Mutex<Instant>,
    violations: Arc<ViolationTracker>,
    /// Cancelled once the handle is destroyed
    retired: CancellationToken,
    crashed: AtomicBool,
    created_at: DateTime<Utc>,
}

impl ExecutionHandle {
    fn new(plugin_id: &str, context_id: ContextId, max_violations: u32) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            context_id,
            connection: OnceLock::new(),
            busy: Arc::new(AtomicUsize::new(0)),
            last_activity: Mutex::new(Instant::now()),
            violations: Arc::new(ViolationTracker::new(max_violations)),
            retired: CancellationToken::new(),
            crashed: AtomicBool::new(false),
            created_at: Utc::now(),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Requests written to the context and not yet answered
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    pub fn is_connected(&self) -> bool {
        !self.retired.is_cancelled()
            && self
                .connection
                .get()
                .map_or(false, |connection| connection.lost().is_none())
    }

    pub fn info(&self) -> HandleInfo {
        HandleInfo {
            plugin_id: self.plugin_id.clone(),
            context_id: self.context_id,
            busy: self.busy(),
            idle_ms: self.idle_for().as_millis() as u64,
            violations: self.violations.count(),
            connected: self.is_connected(),
            created_at: self.created_at,
        }
    }

    fn touch(&self) {
        if let Ok(mut at) = self.last_activity.lock() {
            *at = Instant::now();
        }
    }

    fn connection(&self) -> HostResult<&Connection> {
        if self.retired.is_cancelled() {
            return Err(self.disconnected("context destroyed"));
        }
        self.connection
            .get()
            .ok_or_else(|| HostError::NotRunning(self.plugin_id.clone()))
    }

    fn disconnected(&self, detail: &str) -> HostError {
        HostError::Disconnected(format!("{} ({}): {}", self.plugin_id, self.context_id, detail))
    }
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("plugin_id", &self.plugin_id)
            .field("context_id", &self.context_id)
            .field("busy", &self.busy())
            .finish_non_exhaustive()
    }
}

/// Snapshot of a handle for callers outside the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandleInfo {
    pub plugin_id: String,
    pub context_id: ContextId,
    pub busy: usize,
    pub idle_ms: u64,
    pub violations: u32,
    pub connected: bool,
    pub created_at: DateTime<Utc>,
}

struct ServiceInner {
    adapter: Arc<dyn ExecutionContextAdapter>,
    config: ExecutionConfig,
    router: Option<Arc<dyn HostCallRouter>>,
    handles: RwLock<HashMap<String, Arc<ExecutionHandle>>>,
    crashes: broadcast::Sender<CrashEvent>,
    shutdown: CancellationToken,
}

impl ServiceInner {
    async fn is_current(&self, handle: &ExecutionHandle) -> bool {
        self.handles
            .read()
            .await
            .get(&handle.plugin_id)
            .map_or(false, |current| current.context_id == handle.context_id)
    }

    async fn report_crash(&self, handle: &ExecutionHandle, reason: String) {
        if handle.retired.is_cancelled() || handle.crashed.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.is_current(handle).await {
            return;
        }

        error!(
            plugin_id = %handle.plugin_id,
            context_id = %handle.context_id,
            reason = %reason,
            "execution context crashed"
        );
        let _ = self.crashes.send(CrashEvent {
            plugin_id: handle.plugin_id.clone(),
            context_id: handle.context_id,
            reason,
        });
    }

    async fn on_adapter_crash(&self, notice: CrashNotice) {
        let handle = self
            .handles
            .read()
            .await
            .values()
            .find(|handle| handle.context_id == notice.context_id)
            .cloned();
        match handle {
            Some(handle) => self.report_crash(&handle, notice.reason).await,
            None => debug!(context_id = %notice.context_id, "crash notice for unknown context"),
        }
    }

    async fn ping(&self, handle: &ExecutionHandle) -> HostResult<()> {
        let connection = handle.connection()?;
        let timeout = self.config.ping_timeout();
        match tokio::time::timeout(timeout, connection.control.request(PING_METHOD, Value::Null)).await {
            Ok(Ok(_)) => {
                handle.touch();
                Ok(())
            }
            Ok(Err(e)) => Err(HostError::from(e)),
            Err(_) => Err(HostError::Timeout {
                operation: format!("ping {}", handle.plugin_id),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn check_health(self: &Arc<Self>) {
        let handles: Vec<Arc<ExecutionHandle>> = self.handles.read().await.values().cloned().collect();
        let idle_limit = self.config.idle_ping_after();

        for handle in handles {
            let Some(connection) = handle.connection.get() else {
                continue;
            };
            if let Some(reason) = connection.lost() {
                self.report_crash(&handle, reason.to_string()).await;
                continue;
            }
            if handle.violations.is_tripped() {
                self.report_crash(&handle, "protocol violation limit exceeded".to_string())
                    .await;
                continue;
            }
            if handle.busy() == 0 && handle.idle_for() >= idle_limit {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = inner.ping(&handle).await {
                        inner
                            .report_crash(&handle, format!("health ping failed: {}", e))
                            .await;
                    }
                });
            }
        }
    }
}

pub struct ExecutionService {
    inner: Arc<ServiceInner>,
}

impl ExecutionService {
    /// Create the service and start its health monitor. Must be called inside a tokio
    /// runtime.
    pub fn new(
        adapter: Arc<dyn ExecutionContextAdapter>,
        config: ExecutionConfig,
        router: Option<Arc<dyn HostCallRouter>>,
    ) -> Self {
        let (crashes, _) = broadcast::channel(256);
        let adapter_crashes = adapter.subscribe_crashes();
        let interval = config.health_check_interval();
        let inner = Arc::new(ServiceInner {
            adapter,
            config,
            router,
            handles: RwLock::new(HashMap::new()),
            crashes,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(monitor(
            Arc::downgrade(&inner),
            adapter_crashes,
            inner.shutdown.clone(),
            interval,
        ));
        Self { inner }
    }

    pub fn adapter_kind(&self) -> AdapterKind {
        self.inner.adapter.kind()
    }

    /// Allocate a context for `plugin_id`; an existing handle is returned unchanged
    pub async fn create_context(&self, plugin_id: &str) -> HostResult<Arc<ExecutionHandle>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(HostError::ContextCreationFailed(
                "execution service is shut down".to_string(),
            ));
        }
        if let Some(existing) = self.handle(plugin_id).await {
            return Ok(existing);
        }

        let context_id = self
            .inner
            .adapter
            .create()
            .await
            .map_err(|e| HostError::ContextCreationFailed(e.to_string()))?;

        let handle = Arc::new(ExecutionHandle::new(
            plugin_id,
            context_id,
            self.inner.config.max_protocol_violations,
        ));
        self.inner
            .handles
            .write()
            .await
            .insert(plugin_id.to_string(), Arc::clone(&handle));

        debug!(plugin_id, context_id = %context_id, "created execution context");
        Ok(handle)
    }

    /// Ship code into the context, connect to it and complete the `ping` handshake
    pub async fn load_code(
        &self,
        handle: &Arc<ExecutionHandle>,
        source: &str,
        endowments: &Endowments,
    ) -> HostResult<()> {
        let adapter = &self.inner.adapter;
        let config = &self.inner.config;

        adapter
            .load_code(handle.context_id, source, endowments)
            .await
            .map_err(AdapterError::into_host_error)?;
        let stream = adapter
            .open_stream(handle.context_id)
            .await
            .map_err(|e| HostError::ContextCreationFailed(e.to_string()))?;

        let mux = Multiplexer::new(stream, config.max_frame_payload, Arc::clone(&handle.violations));
        let connection = open_connection(&mux, handle, self.inner.router.clone())
            .map_err(|e| HostError::ContextCreationFailed(e.to_string()))?;
        mux.start()
            .map_err(|e| HostError::ContextCreationFailed(e.to_string()))?;

        let init_timeout = config.init_timeout();
        match tokio::time::timeout(init_timeout, connection.0.request(PING_METHOD, Value::Null)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(HostError::ExecutionError(format!(
                    "initialization handshake failed: {}",
                    e
                )))
            }
            Err(_) => {
                return Err(HostError::Timeout {
                    operation: format!("initialization handshake for {}", handle.plugin_id),
                    timeout_ms: init_timeout.as_millis() as u64,
                })
            }
        }

        let (control, rpc) = connection;
        handle
            .connection
            .set(Connection { mux, control, rpc })
            .map_err(|_| HostError::ExecutionError("code already loaded".to_string()))?;
        handle.touch();

        tokio::spawn(watch_connection(Arc::downgrade(&self.inner), Arc::clone(handle)));

        info!(
            plugin_id = %handle.plugin_id,
            context_id = %handle.context_id,
            endowments = endowments.len(),
            "execution context ready"
        );
        Ok(())
    }

    /// Tear a context down. Never fails; adapter errors are logged.
    pub async fn destroy_context(&self, handle: &ExecutionHandle) {
        handle.retired.cancel();
        {
            let mut handles = self.inner.handles.write().await;
            let current = handles
                .get(&handle.plugin_id)
                .map_or(false, |h| h.context_id == handle.context_id);
            if current {
                handles.remove(&handle.plugin_id);
            }
        }

        if let Some(connection) = handle.connection.get() {
            connection.mux.shutdown();
            connection.rpc.close().await;
            connection.control.close().await;
        }

        match self.inner.adapter.destroy(handle.context_id).await {
            Ok(()) => debug!(
                plugin_id = %handle.plugin_id,
                context_id = %handle.context_id,
                "destroyed execution context"
            ),
            Err(e) => warn!(
                plugin_id = %handle.plugin_id,
                context_id = %handle.context_id,
                "context teardown reported an error: {}",
                e
            ),
        }
    }

    /// Send one request to the context and wait for its response, the timeout, or
    /// `cancel`, whichever comes first. The busy counter stays raised until the
    /// response arrives or the handle is destroyed.
    pub async fn dispatch(
        &self,
        handle: &ExecutionHandle,
        method: &str,
        params: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> HostResult<Value> {
        let connection = handle.connection()?;
        let guard = BusyGuard::new(Arc::clone(&handle.busy));
        handle.touch();

        let call = connection
            .rpc
            .call(method, params, Some(guard))
            .await
            .map_err(|e| rpc_failure(handle, e))?;
        let id = call.id().clone();
        debug!(plugin_id = %handle.plugin_id, %id, method, "dispatched request");

        let wait = call.wait();
        tokio::pin!(wait);
        let outcome = tokio::select! {
            outcome = &mut wait => outcome.map_err(|e| rpc_failure(handle, e)),
            _ = tokio::time::sleep(timeout) => {
                warn!(plugin_id = %handle.plugin_id, %id, timeout_ms = timeout.as_millis() as u64, "request timed out");
                Err(HostError::Timeout {
                    operation: format!("{} on {}", method, handle.plugin_id),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            _ = cancel.cancelled() => {
                if let Err(e) = connection.rpc.cancel(&id).await {
                    debug!(plugin_id = %handle.plugin_id, %id, "cancel notice not delivered: {}", e);
                }
                Err(HostError::Cancelled(format!("{} on {}", method, handle.plugin_id)))
            }
        };

        handle.touch();
        outcome
    }

    /// Best-effort cancellation notice for one in-flight request
    pub async fn cancel(&self, handle: &ExecutionHandle, id: &RequestId) -> HostResult<()> {
        let connection = handle.connection()?;
        connection
            .rpc
            .cancel(id)
            .await
            .map_err(|e| rpc_failure(handle, e))
    }

    pub async fn ping(&self, handle: &ExecutionHandle) -> HostResult<()> {
        self.inner.ping(handle).await
    }

    /// Concrete bindings for a grant set
    pub fn compute_endowments(&self, grants: &PermissionSet) -> Endowments {
        Endowments::from_grants(grants)
    }

    pub async fn handle(&self, plugin_id: &str) -> Option<Arc<ExecutionHandle>> {
        self.inner.handles.read().await.get(plugin_id).cloned()
    }

    pub async fn has_handle(&self, plugin_id: &str) -> bool {
        self.inner.handles.read().await.contains_key(plugin_id)
    }

    pub async fn handle_info(&self, plugin_id: &str) -> Option<HandleInfo> {
        self.handle(plugin_id).await.map(|handle| handle.info())
    }

    pub async fn handle_count(&self) -> usize {
        self.inner.handles.read().await.len()
    }

    pub fn subscribe_crashes(&self) -> broadcast::Receiver<CrashEvent> {
        self.inner.crashes.subscribe()
    }

    /// Stop the monitor and destroy every context
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles: Vec<Arc<ExecutionHandle>> = self.inner.handles.read().await.values().cloned().collect();
        for handle in handles {
            self.destroy_context(&handle).await;
        }
        info!("execution service shut down");
    }
}

impl Drop for ExecutionService {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl std::fmt::Debug for ExecutionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionService")
            .field("adapter", &self.inner.adapter.kind())
            .finish_non_exhaustive()
    }
}

fn open_connection(
    mux: &Multiplexer,
    handle: &ExecutionHandle,
    router: Option<Arc<dyn HostCallRouter>>,
) -> Result<(RpcChannel, RpcChannel), MuxError> {
    let control = RpcChannel::new(
        mux.open_channel(CONTROL_CHANNEL)?,
        Arc::clone(&handle.violations),
        None,
    );
    let inbound = router.map(|router| {
        Arc::new(HostCallInbound {
            plugin_id: handle.plugin_id.clone(),
            router,
        }) as Arc<dyn InboundHandler>
    });
    let rpc = RpcChannel::new(
        mux.open_channel(RPC_CHANNEL)?,
        Arc::clone(&handle.violations),
        inbound,
    );
    let console = mux.open_channel(CONSOLE_CHANNEL)?;
    tokio::spawn(forward_console(handle.plugin_id.clone(), console));
    Ok((control, rpc))
}

fn rpc_failure(handle: &ExecutionHandle, error: RpcError) -> HostError {
    match error {
        RpcError::Disconnected => handle.disconnected("channel closed"),
        RpcError::Remote(object) if object.code == codes::REQUEST_CANCELLED => {
            HostError::Cancelled(format!("{}: {}", handle.plugin_id, object.message))
        }
        other => HostError::from(other),
    }
}

async fn forward_console(plugin_id: String, mut console: MuxChannel) {
    while let Some(line) = console.recv().await {
        info!(
            target: PLUGIN_CONSOLE_TARGET,
            plugin_id = %plugin_id,
            "{}",
            String::from_utf8_lossy(&line).trim_end()
        );
    }
}

async fn watch_connection(inner: Weak<ServiceInner>, handle: Arc<ExecutionHandle>) {
    let Some(connection) = handle.connection.get() else {
        return;
    };
    let closed = connection.mux.closed();
    let rpc_closed = connection.rpc.closed();
    let control_closed = connection.control.closed();
    let tripped = handle.violations.tripped();

    let reason = tokio::select! {
        biased;
        _ = handle.retired.cancelled() => return,
        _ = closed.cancelled() => "transport closed",
        _ = tripped.cancelled() => "protocol violation limit exceeded",
        _ = rpc_closed.cancelled() => "rpc channel closed",
        _ = control_closed.cancelled() => "control channel closed",
    };

    if let Some(inner) = inner.upgrade() {
        inner.report_crash(&handle, reason.to_string()).await;
    }
}

async fn monitor(
    inner: Weak<ServiceInner>,
    mut adapter_crashes: broadcast::Receiver<CrashNotice>,
    shutdown: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut adapter_open = true;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            notice = adapter_crashes.recv(), if adapter_open => match notice {
                Ok(notice) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.on_adapter_crash(notice).await;
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "crash notices lagged");
                }
                Err(RecvError::Closed) => adapter_open = false,
            },
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.check_health().await;
            }
        }
    }
    debug!("execution monitor stopped");
}
