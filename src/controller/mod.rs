//! Plugin Controller
//!
//! The top-level state machine. It owns every plugin's descriptor and runtime record
//! and is the only caller of the execution service and the permission engine.
//!
//! Lifecycle operations on one plugin are serialized by a per-plugin mutex. `invoke`
//! holds that mutex only while it is admitted (status and permission checks, handle
//! lookup) and waits for the response outside it, so a `stop` is never queued behind
//! a slow invocation. `stop` publishes `Stopping` before tearing the context down, and
//! invocations arriving from then on fail with `NotRunning` without waiting.
//!
//! ```text
//!   Installing ─> Stopped ─> Starting ─> Running ─> Stopping ─> Stopped
//!                    │ ^                    │
//!                    v │                    └──(crash / timeout)──> Stopped
//!                  Updating
//!   any non-transient state ──(block)──> Blocked      (uninstall)──> Removed
//! ```

pub mod host;
pub mod state;
pub mod store;

pub use host::{HostApi, NoHostApi};
pub use state::{
    PluginDescriptor, PluginEvent, PluginRuntimeState, PluginSnapshot, PluginSource, PluginStatus,
};
pub use store::{JsonFileStore, MemoryStore, StateSnapshot, StateStore, StoreError};

use crate::config::{AdapterConfig, HostConfig};
use crate::error::{HostError, HostResult};
use crate::execution::{
    ContextId, CrashEvent, ExecutionContextAdapter, ExecutionService, GuestRequest, HandleInfo,
    InProcessAdapter, ProcessAdapter, ProgramLoader, INVOKE_METHOD,
};
use crate::permissions::{
    ApprovalPolicy, CaveatContext, ConfigApprovalPolicy, HandlerKind, Permission, PermissionEngine,
};
use host::HostCallHandler;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) struct PluginRecord {
    pub(crate) descriptor: PluginDescriptor,
    pub(crate) state: PluginRuntimeState,
}

pub(crate) struct PluginSlot {
    /// Serializes lifecycle operations on this plugin
    op: Mutex<()>,
    pub(crate) record: RwLock<PluginRecord>,
}

impl PluginSlot {
    fn new(descriptor: PluginDescriptor, state: PluginRuntimeState) -> Self {
        Self {
            op: Mutex::new(()),
            record: RwLock::new(PluginRecord { descriptor, state }),
        }
    }

    async fn status(&self) -> PluginStatus {
        self.record.read().await.state.status
    }

    async fn set_status(&self, status: PluginStatus) {
        let mut record = self.record.write().await;
        record.state.status = status;
        record.state.touch();
    }

    async fn snapshot(&self) -> PluginSnapshot {
        let record = self.record.read().await;
        PluginSnapshot {
            descriptor: record.descriptor.clone(),
            state: record.state.clone(),
        }
    }
}

/// One call into a plugin handler
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRequest {
    pub handler: HandlerKind,
    pub origin: Option<String>,
    pub method: String,
    pub params: Value,
    /// Capabilities the request needs besides the handler's own
    pub requires: Vec<String>,
    /// Per-request bound; the configured default applies when unset
    pub timeout: Option<Duration>,
}

impl InvokeRequest {
    pub fn new(handler: HandlerKind, method: impl Into<String>, params: Value) -> Self {
        Self {
            handler,
            origin: None,
            method: method.into(),
            params,
            requires: Vec::new(),
            timeout: None,
        }
    }

    pub fn rpc(method: impl Into<String>, params: Value) -> Self {
        Self::new(HandlerKind::Rpc, method, params)
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn requiring(mut self, capability: impl Into<String>) -> Self {
        self.requires.push(capability.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn capabilities(&self) -> Vec<&str> {
        std::iter::once(self.handler.capability())
            .chain(self.requires.iter().map(String::as_str))
            .collect()
    }

    fn caveat_context(&self) -> CaveatContext {
        CaveatContext {
            origin: self.origin.clone(),
            method: Some(self.method.clone()),
            ..CaveatContext::default()
        }
    }
}

/// Assembles a [`PluginController`]; anything not supplied is derived from the
/// configuration
pub struct ControllerBuilder {
    config: HostConfig,
    adapter: Option<Arc<dyn ExecutionContextAdapter>>,
    loader: Option<Arc<dyn ProgramLoader>>,
    policy: Option<Arc<dyn ApprovalPolicy>>,
    store: Option<Arc<dyn StateStore>>,
    host_api: Option<Arc<dyn HostApi>>,
}

impl ControllerBuilder {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            adapter: None,
            loader: None,
            policy: None,
            store: None,
            host_api: None,
        }
    }

    pub fn adapter(mut self, adapter: Arc<dyn ExecutionContextAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Loader used when the configuration selects the in-process adapter
    pub fn program_loader(mut self, loader: Arc<dyn ProgramLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn approval_policy(mut self, policy: Arc<dyn ApprovalPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn host_api(mut self, api: Arc<dyn HostApi>) -> Self {
        self.host_api = Some(api);
        self
    }

    /// Build the controller and start its background tasks. Must be called inside a
    /// tokio runtime.
    pub fn build(self) -> HostResult<PluginController> {
        let config = self.config;
        config.validate()?;

        let adapter: Arc<dyn ExecutionContextAdapter> = match (self.adapter, &config.execution.adapter) {
            (Some(adapter), _) => adapter,
            (None, AdapterConfig::InProcess) => {
                let loader = self.loader.ok_or_else(|| {
                    HostError::Config("the in-process adapter needs a program loader".to_string())
                })?;
                Arc::new(InProcessAdapter::new(loader, &config.execution))
            }
            (None, AdapterConfig::Process { command, args, sandbox_dir }) => Arc::new(ProcessAdapter::new(
                command.clone(),
                args.clone(),
                sandbox_dir.clone(),
                config.execution.max_contexts,
            )),
        };

        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(ConfigApprovalPolicy::new(&config.permissions)));
        let store: Arc<dyn StateStore> = match self.store {
            Some(store) => store,
            None if config.persistence.enabled => {
                Arc::new(JsonFileStore::new(config.persistence.state_path.clone()))
            }
            None => Arc::new(MemoryStore::new()),
        };
        let host_api = self.host_api.unwrap_or_else(|| Arc::new(NoHostApi));

        let engine = Arc::new(PermissionEngine::new(policy));
        let plugins = Arc::new(RwLock::new(HashMap::new()));
        let router = HostCallHandler::new(Arc::clone(&plugins), Arc::clone(&engine), host_api);
        let execution = ExecutionService::new(adapter, config.execution.clone(), Some(Arc::new(router)));
        let crashes = execution.subscribe_crashes();
        let (events, _) = broadcast::channel(256);

        let inner = Arc::new(ControllerInner {
            config,
            plugins,
            engine,
            execution,
            store,
            events,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(watch_crashes(
            Arc::downgrade(&inner),
            crashes,
            inner.shutdown.clone(),
        ));

        info!(adapter = ?inner.execution.adapter_kind(), "plugin controller ready");
        Ok(PluginController { inner })
    }
}

struct ControllerInner {
    config: HostConfig,
    plugins: Arc<RwLock<HashMap<String, Arc<PluginSlot>>>>,
    engine: Arc<PermissionEngine>,
    execution: ExecutionService,
    store: Arc<dyn StateStore>,
    events: broadcast::Sender<PluginEvent>,
    shutdown: CancellationToken,
}

impl ControllerInner {
    async fn slot(&self, plugin_id: &str) -> HostResult<Arc<PluginSlot>> {
        self.plugins
            .read()
            .await
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| HostError::NotFound(plugin_id.to_string()))
    }

    fn emit(&self, event: PluginEvent) {
        debug!(plugin_id = %event.plugin_id(), ?event, "plugin event");
        let _ = self.events.send(event);
    }

    /// Record snapshot with the live handle's busy counter filled in
    async fn snapshot(&self, slot: &PluginSlot) -> PluginSnapshot {
        let mut snapshot = slot.snapshot().await;
        snapshot.state.active_invocations = self
            .execution
            .handle(&snapshot.descriptor.id)
            .await
            .map_or(0, |handle| handle.busy());
        snapshot
    }

    async fn persist(&self, slot: &PluginSlot) -> HostResult<()> {
        let snapshot = slot.snapshot().await;
        self.store.save_plugin(&snapshot).await?;
        Ok(())
    }

    /// Persist a status-only change; a failure here does not undo the transition
    async fn persist_quietly(&self, slot: &PluginSlot) {
        if let Err(e) = self.persist(slot).await {
            warn!("failed to persist plugin state: {}", e);
        }
    }

    /// Write a replacement record only once the store accepted it
    async fn commit(
        &self,
        slot: &PluginSlot,
        descriptor: PluginDescriptor,
        mut state: PluginRuntimeState,
    ) -> HostResult<PluginRuntimeState> {
        state.touch();
        let snapshot = PluginSnapshot {
            descriptor,
            state: state.clone(),
        };
        self.store.save_plugin(&snapshot).await?;

        let mut record = slot.record.write().await;
        record.descriptor = snapshot.descriptor;
        record.state = state.clone();
        Ok(state)
    }

    async fn teardown(&self, plugin_id: &str) {
        if let Some(handle) = self.execution.handle(plugin_id).await {
            self.execution.destroy_context(&handle).await;
        }
    }

    /// Stop a live plugin; the caller holds the plugin's op lock
    async fn stop_locked(&self, slot: &PluginSlot, plugin_id: &str) {
        slot.set_status(PluginStatus::Stopping).await;
        self.teardown(plugin_id).await;
        slot.set_status(PluginStatus::Stopped).await;
        info!(plugin_id, "plugin stopped");
        self.emit(PluginEvent::Stopped {
            plugin_id: plugin_id.to_string(),
        });
    }

    /// Force `Stopped` after the context behind `context_id` was lost. Stale reports for
    /// a context that is already gone are ignored.
    async fn handle_context_loss(&self, plugin_id: &str, context_id: ContextId, cause: HostError) {
        let Ok(slot) = self.slot(plugin_id).await else {
            return;
        };
        let _op = slot.op.lock().await;

        let Some(handle) = self.execution.handle(plugin_id).await else {
            return;
        };
        if handle.context_id() != context_id {
            return;
        }

        self.execution.destroy_context(&handle).await;
        {
            let mut record = slot.record.write().await;
            if record.state.status.is_live() {
                record.state.status = PluginStatus::Stopped;
            }
            record.state.record_error(&cause);
            record.state.touch();
        }
        self.persist_quietly(&slot).await;

        error!(plugin_id, context_id = %context_id, "plugin stopped after context loss: {}", cause);
        self.emit(PluginEvent::Crashed {
            plugin_id: plugin_id.to_string(),
            reason: cause.to_string(),
        });
    }

    fn resolve_timeout(&self, request: &InvokeRequest, granted: &crate::permissions::PermissionSet) -> Duration {
        let ceiling = PermissionEngine::max_request_time(granted, &request.capabilities());
        match (request.timeout, ceiling) {
            (Some(requested), Some(ceiling)) => requested.min(ceiling),
            (Some(requested), None) => requested,
            (None, Some(ceiling)) => ceiling,
            (None, None) => self.config.execution.default_timeout(),
        }
    }
}

fn not_running(plugin_id: &str, status: PluginStatus) -> HostError {
    match status {
        PluginStatus::Blocked => HostError::Blocked(plugin_id.to_string()),
        _ => HostError::NotRunning(plugin_id.to_string()),
    }
}

/// Handle to the plugin host; cheap to clone
#[derive(Clone)]
pub struct PluginController {
    inner: Arc<ControllerInner>,
}

impl PluginController {
    pub fn builder(config: HostConfig) -> ControllerBuilder {
        ControllerBuilder::new(config)
    }

    pub fn execution(&self) -> &ExecutionService {
        &self.inner.execution
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PluginEvent> {
        self.inner.events.subscribe()
    }

    /// Install a plugin in `Stopped`. Requested permissions are granted or left pending
    /// according to the approval policy; a denied request fails the install.
    pub async fn install(&self, descriptor: PluginDescriptor) -> HostResult<PluginRuntimeState> {
        descriptor.validate()?;
        let inner = &self.inner;
        let plugin_id = descriptor.id.clone();

        let slot = {
            let mut plugins = inner.plugins.write().await;
            if plugins.contains_key(&plugin_id) {
                return Err(HostError::AlreadyInstalled(plugin_id));
            }
            let slot = Arc::new(PluginSlot::new(
                descriptor.clone(),
                PluginRuntimeState::new(Default::default(), Vec::new()),
            ));
            plugins.insert(plugin_id.clone(), Arc::clone(&slot));
            slot
        };
        let _op = slot.op.lock().await;

        let outcome = match inner.engine.authorize(&plugin_id, &descriptor.permissions) {
            Ok(authorization) => {
                let mut state = PluginRuntimeState::new(authorization.granted, authorization.pending);
                state.status = PluginStatus::Stopped;
                inner.commit(&slot, descriptor.clone(), state).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(state) => {
                info!(
                    plugin_id = %plugin_id,
                    version = %descriptor.version,
                    granted = state.granted.len(),
                    pending = state.pending.len(),
                    "plugin installed"
                );
                inner.emit(PluginEvent::Installed {
                    plugin_id,
                    version: descriptor.version.to_string(),
                });
                Ok(state)
            }
            Err(e) => {
                warn!(plugin_id = %plugin_id, "install failed: {}", e);
                let mut plugins = inner.plugins.write().await;
                if plugins.get(&plugin_id).map_or(false, |s| Arc::ptr_eq(s, &slot)) {
                    plugins.remove(&plugin_id);
                }
                Err(e)
            }
        }
    }

    /// Stop the plugin if needed and delete it with its persisted record
    pub async fn uninstall(&self, plugin_id: &str) -> HostResult<()> {
        let inner = &self.inner;
        let slot = inner.slot(plugin_id).await?;
        let _op = slot.op.lock().await;

        let status = slot.status().await;
        match status {
            PluginStatus::Installing | PluginStatus::Removed => {
                return Err(HostError::invalid_transition("uninstall", status))
            }
            status if status.is_live() => inner.stop_locked(&slot, plugin_id).await,
            _ => {}
        }

        inner.store.remove_plugin(plugin_id).await?;
        slot.set_status(PluginStatus::Removed).await;
        {
            let mut plugins = inner.plugins.write().await;
            if plugins.get(plugin_id).map_or(false, |s| Arc::ptr_eq(s, &slot)) {
                plugins.remove(plugin_id);
            }
        }

        info!(plugin_id, "plugin uninstalled");
        inner.emit(PluginEvent::Uninstalled {
            plugin_id: plugin_id.to_string(),
        });
        Ok(())
    }

    /// Start a stopped plugin. Starting a running plugin returns its existing handle.
    /// A failed start leaves the plugin `Stopped` with `last_error` set; it is not retried.
    pub async fn start(&self, plugin_id: &str) -> HostResult<HandleInfo> {
        let inner = &self.inner;
        let slot = inner.slot(plugin_id).await?;
        let _op = slot.op.lock().await;

        let (descriptor, granted) = {
            let record = slot.record.read().await;
            match record.state.status {
                PluginStatus::Running | PluginStatus::Starting => {
                    if let Some(info) = inner.execution.handle_info(plugin_id).await {
                        return Ok(info);
                    }
                }
                PluginStatus::Blocked => return Err(HostError::Blocked(plugin_id.to_string())),
                PluginStatus::Stopped => {}
                other => return Err(HostError::invalid_transition("start", other)),
            }
            if !record.state.enabled {
                return Err(HostError::Disabled(plugin_id.to_string()));
            }
            (record.descriptor.clone(), record.state.granted.clone())
        };

        slot.set_status(PluginStatus::Starting).await;
        debug!(plugin_id, "starting plugin");

        match self.launch(plugin_id, &descriptor, &granted).await {
            Ok(info) => {
                slot.set_status(PluginStatus::Running).await;
                info!(plugin_id, context_id = %info.context_id, "plugin running");
                inner.emit(PluginEvent::Started {
                    plugin_id: plugin_id.to_string(),
                    context_id: info.context_id.to_string(),
                });
                Ok(info)
            }
            Err(e) => {
                {
                    let mut record = slot.record.write().await;
                    record.state.status = PluginStatus::Stopped;
                    record.state.record_error(&e);
                    record.state.touch();
                }
                inner.persist_quietly(&slot).await;
                error!(plugin_id, "plugin failed to start: {}", e);
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        plugin_id: &str,
        descriptor: &PluginDescriptor,
        granted: &crate::permissions::PermissionSet,
    ) -> HostResult<HandleInfo> {
        let execution = &self.inner.execution;
        let source = descriptor.source.load().await?;
        let endowments = execution.compute_endowments(granted);

        let handle = execution.create_context(plugin_id).await?;
        if let Err(e) = execution.load_code(&handle, &source, &endowments).await {
            execution.destroy_context(&handle).await;
            return Err(e);
        }
        Ok(handle.info())
    }

    /// Stop a running plugin. Stopping a stopped plugin is a no-op.
    pub async fn stop(&self, plugin_id: &str) -> HostResult<()> {
        let inner = &self.inner;
        let slot = inner.slot(plugin_id).await?;
        let _op = slot.op.lock().await;

        match slot.status().await {
            PluginStatus::Stopped | PluginStatus::Blocked => Ok(()),
            PluginStatus::Running | PluginStatus::Starting => {
                inner.stop_locked(&slot, plugin_id).await;
                inner.persist_quietly(&slot).await;
                Ok(())
            }
            other => Err(HostError::invalid_transition("stop", other)),
        }
    }

    pub async fn invoke(&self, plugin_id: &str, request: InvokeRequest) -> HostResult<Value> {
        self.invoke_with_cancel(plugin_id, request, CancellationToken::new())
            .await
    }

    /// Invoke a handler. Cancelling `cancel` releases the caller at once with
    /// `Cancelled` and sends a best-effort cancel notice into the context.
    pub async fn invoke_with_cancel(
        &self,
        plugin_id: &str,
        request: InvokeRequest,
        cancel: CancellationToken,
    ) -> HostResult<Value> {
        let inner = &self.inner;
        let slot = inner.slot(plugin_id).await?;

        // Fail fast while a lifecycle operation is under way.
        let status = slot.status().await;
        if status != PluginStatus::Running {
            return Err(not_running(plugin_id, status));
        }

        let (handle, timeout) = {
            let _op = slot.op.lock().await;
            let record = slot.record.read().await;
            if record.state.status != PluginStatus::Running {
                return Err(not_running(plugin_id, record.state.status));
            }

            let ctx = request.caveat_context();
            for capability in request.capabilities() {
                inner
                    .engine
                    .check(plugin_id, &record.state.granted, capability, &ctx)?;
            }

            let handle = inner
                .execution
                .handle(plugin_id)
                .await
                .ok_or_else(|| HostError::NotRunning(plugin_id.to_string()))?;
            let timeout = inner.resolve_timeout(&request, &record.state.granted);
            (handle, timeout)
        };

        let params = serde_json::to_value(GuestRequest {
            handler: request.handler,
            origin: request.origin,
            method: request.method,
            params: request.params,
        })
        .map_err(|e| HostError::ProtocolViolation(e.to_string()))?;

        let outcome = inner
            .execution
            .dispatch(&handle, INVOKE_METHOD, params, timeout, &cancel)
            .await;

        if let Err(e) = &outcome {
            if e.is_infrastructure() {
                inner
                    .handle_context_loss(plugin_id, handle.context_id(), e.clone())
                    .await;
            }
        }
        outcome
    }

    /// Replace a stopped plugin's descriptor with a newer version. A running plugin is
    /// stopped first. Grants re-requested unchanged carry over, new requests go through
    /// approval, grants no longer requested are revoked.
    pub async fn update(
        &self,
        plugin_id: &str,
        descriptor: PluginDescriptor,
    ) -> HostResult<PluginRuntimeState> {
        descriptor.validate()?;
        if descriptor.id != plugin_id {
            return Err(HostError::InvalidDescriptor(format!(
                "update for {} carries id {}",
                plugin_id, descriptor.id
            )));
        }

        let inner = &self.inner;
        let slot = inner.slot(plugin_id).await?;
        let _op = slot.op.lock().await;

        let (current, state) = {
            let record = slot.record.read().await;
            (record.descriptor.clone(), record.state.clone())
        };
        if descriptor.version <= current.version {
            return Err(HostError::InvalidDescriptor(format!(
                "{}: {} is not newer than {}",
                plugin_id, descriptor.version, current.version
            )));
        }
        match state.status {
            PluginStatus::Blocked => return Err(HostError::Blocked(plugin_id.to_string())),
            PluginStatus::Stopped => {}
            status if status.is_live() => inner.stop_locked(&slot, plugin_id).await,
            other => return Err(HostError::invalid_transition("update", other)),
        }

        slot.set_status(PluginStatus::Updating).await;
        let replacement = match inner
            .engine
            .reauthorize(plugin_id, &state.granted, &descriptor.permissions)
        {
            Ok(authorization) => {
                let mut next = state.clone();
                next.status = PluginStatus::Stopped;
                next.granted = authorization.granted;
                next.pending = authorization.pending;
                inner
                    .commit(&slot, descriptor.clone(), next)
                    .await
                    .map(|next| (next, authorization.revoked))
            }
            Err(e) => Err(e),
        };

        match replacement {
            Ok((next, revoked)) => {
                info!(
                    plugin_id,
                    from = %current.version,
                    to = %descriptor.version,
                    pending = next.pending.len(),
                    "plugin updated"
                );
                inner.emit(PluginEvent::Updated {
                    plugin_id: plugin_id.to_string(),
                    from: current.version.to_string(),
                    to: descriptor.version.to_string(),
                });
                for capability in revoked {
                    inner.emit(PluginEvent::PermissionRevoked {
                        plugin_id: plugin_id.to_string(),
                        capability,
                    });
                }
                Ok(next)
            }
            Err(e) => {
                slot.set_status(PluginStatus::Stopped).await;
                warn!(plugin_id, "update rejected: {}", e);
                Err(e)
            }
        }
    }

    /// Grant a pending permission request. A running context keeps the endowments it
    /// was started with until it is restarted.
    pub async fn approve_permission(
        &self,
        plugin_id: &str,
        capability: &str,
    ) -> HostResult<PluginRuntimeState> {
        let inner = &self.inner;
        let slot = inner.slot(plugin_id).await?;
        let _op = slot.op.lock().await;

        let (descriptor, mut state) = {
            let record = slot.record.read().await;
            (record.descriptor.clone(), record.state.clone())
        };
        if state.blocked {
            return Err(HostError::Blocked(plugin_id.to_string()));
        }
        let position = state
            .pending
            .iter()
            .position(|request| request.capability == capability)
            .ok_or_else(|| HostError::invalid_transition(&format!("approve {}", capability), "not requested"))?;

        let request = state.pending.remove(position);
        state.granted.insert(Permission::from(&request));
        let state = inner.commit(&slot, descriptor, state).await?;

        info!(plugin_id, capability, "permission granted");
        inner.emit(PluginEvent::PermissionGranted {
            plugin_id: plugin_id.to_string(),
            capability: capability.to_string(),
        });
        Ok(state)
    }

    /// Revoke a grant. The next invoke or host call needing it fails with
    /// `PermissionDenied`; endowments inside a running context stay until restart.
    /// Returns whether anything was revoked.
    pub async fn revoke_permission(&self, plugin_id: &str, capability: &str) -> HostResult<bool> {
        let inner = &self.inner;
        let slot = inner.slot(plugin_id).await?;
        let _op = slot.op.lock().await;

        let (descriptor, mut state) = {
            let record = slot.record.read().await;
            (record.descriptor.clone(), record.state.clone())
        };
        let was_granted = state.granted.remove(capability).is_some();
        let pending_before = state.pending.len();
        state.pending.retain(|request| request.capability != capability);
        if !was_granted && state.pending.len() == pending_before {
            return Ok(false);
        }

        let live = state.status.is_live();
        inner.commit(&slot, descriptor, state).await?;
        if was_granted {
            info!(plugin_id, capability, live, "permission revoked");
            inner.emit(PluginEvent::PermissionRevoked {
                plugin_id: plugin_id.to_string(),
                capability: capability.to_string(),
            });
        }
        Ok(was_granted)
    }

    pub async fn enable(&self, plugin_id: &str) -> HostResult<()> {
        let inner = &self.inner;
        let slot = inner.slot(plugin_id).await?;
        let _op = slot.op.lock().await;

        let (descriptor, mut state) = {
            let record = slot.record.read().await;
            (record.descriptor.clone(), record.state.clone())
        };
        if state.blocked {
            return Err(HostError::Blocked(plugin_id.to_string()));
        }
        if state.enabled {
            return Ok(());
        }
        state.enabled = true;
        inner.commit(&slot, descriptor, state).await?;
        inner.emit(PluginEvent::Enabled {
            plugin_id: plugin_id.to_string(),
        });
        Ok(())
    }

    /// Disable a plugin, stopping it first if it runs
    pub async fn disable(&self, plugin_id: &str) -> HostResult<()> {
        let inner = &self.inner;
        let slot = inner.slot(plugin_id).await?;
        let _op = slot.op.lock().await;

        if slot.status().await.is_live() {
            inner.stop_locked(&slot, plugin_id).await;
        }
        let (descriptor, mut state) = {
            let record = slot.record.read().await;
            (record.descriptor.clone(), record.state.clone())
        };
        if !state.enabled {
            return Ok(());
        }
        state.enabled = false;
        inner.commit(&slot, descriptor, state).await?;
        inner.emit(PluginEvent::Disabled {
            plugin_id: plugin_id.to_string(),
        });
        Ok(())
    }

    /// Stop the plugin and move it to the absorbing `Blocked` state
    pub async fn block(&self, plugin_id: &str, reason: &str) -> HostResult<()> {
        let inner = &self.inner;
        let slot = inner.slot(plugin_id).await?;
        let _op = slot.op.lock().await;

        let status = slot.status().await;
        match status {
            PluginStatus::Blocked => return Ok(()),
            status if status.is_live() => inner.stop_locked(&slot, plugin_id).await,
            PluginStatus::Stopped => {}
            other => return Err(HostError::invalid_transition("block", other)),
        }

        let (descriptor, mut state) = {
            let record = slot.record.read().await;
            (record.descriptor.clone(), record.state.clone())
        };
        state.status = PluginStatus::Blocked;
        state.blocked = true;
        state.block_reason = Some(reason.to_string());
        if let Err(e) = inner.commit(&slot, descriptor, state).await {
            warn!(plugin_id, "block not persisted: {}", e);
            return Err(e);
        }

        warn!(plugin_id, reason, "plugin blocked");
        inner.emit(PluginEvent::Blocked {
            plugin_id: plugin_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    pub async fn get_state(&self, plugin_id: &str) -> HostResult<PluginRuntimeState> {
        let slot = self.inner.slot(plugin_id).await?;
        Ok(self.inner.snapshot(&slot).await.state)
    }

    pub async fn get_descriptor(&self, plugin_id: &str) -> HostResult<PluginDescriptor> {
        let slot = self.inner.slot(plugin_id).await?;
        let descriptor = slot.record.read().await.descriptor.clone();
        Ok(descriptor)
    }

    /// Every installed plugin, ordered by id
    pub async fn list_plugins(&self) -> Vec<PluginSnapshot> {
        let slots: Vec<Arc<PluginSlot>> = self.inner.plugins.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(slots.len());
        for slot in slots {
            snapshots.push(self.inner.snapshot(&slot).await);
        }
        snapshots.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        snapshots
    }

    /// Rebuild plugins from the store; nothing comes back running. Returns how many
    /// plugins were added.
    pub async fn restore(&self) -> HostResult<usize> {
        let snapshot = self.inner.store.load().await?;
        let mut plugins = self.inner.plugins.write().await;
        let mut restored = 0;
        for (plugin_id, plugin) in snapshot.plugins {
            if plugins.contains_key(&plugin_id) {
                debug!(plugin_id = %plugin_id, "already loaded; skipping restore");
                continue;
            }
            let plugin = plugin.restored();
            plugins.insert(
                plugin_id,
                Arc::new(PluginSlot::new(plugin.descriptor, plugin.state)),
            );
            restored += 1;
        }
        info!(restored, "restored plugin state");
        Ok(restored)
    }

    /// Stop every plugin and the execution service
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();

        let slots: Vec<(String, Arc<PluginSlot>)> = inner
            .plugins
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();
        for (plugin_id, slot) in slots {
            let _op = slot.op.lock().await;
            if slot.status().await.is_live() {
                inner.stop_locked(&slot, &plugin_id).await;
                inner.persist_quietly(&slot).await;
            }
        }

        inner.execution.shutdown().await;
        info!("plugin controller shut down");
    }
}

impl std::fmt::Debug for PluginController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginController")
            .field("execution", &self.inner.execution)
            .finish_non_exhaustive()
    }
}

async fn watch_crashes(
    inner: Weak<ControllerInner>,
    mut crashes: broadcast::Receiver<CrashEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = crashes.recv() => event,
        };

        match event {
            Ok(event) => {
                let Some(controller) = inner.upgrade() else { break };
                tokio::spawn(async move {
                    let cause = HostError::Disconnected(event.reason.clone());
                    controller
                        .handle_context_loss(&event.plugin_id, event.context_id, cause)
                        .await;
                });
            }
            Err(RecvError::Lagged(missed)) => warn!(missed, "crash events lagged"),
            Err(RecvError::Closed) => break,
        }
    }
    debug!("crash watcher stopped");
}
