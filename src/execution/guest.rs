//! Sandbox side of the host protocol.
//!
//! [`GuestRuntime`] runs inside a context (a tokio task for the in-process adapter, or
//! a worker process speaking over stdio). It answers `ping` on the control channel,
//! runs each `invoke` as its own task, and aborts an invocation when the host sends a
//! cancel notification for it.

use super::endowments::Endowments;
use super::{CONSOLE_CHANNEL, CONTROL_CHANNEL, INVOKE_METHOD, PING_METHOD, RPC_CHANNEL};
use crate::mux::{ByteStream, ChannelSender, MuxError, Multiplexer, ViolationTracker};
use crate::permissions::{capability_for_host_call, HandlerKind};
use crate::rpc::{InboundHandler, RequestId, RpcChannel, RpcError, RpcErrorObject, CANCEL_METHOD};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Params of an `invoke` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestRequest {
    pub handler: HandlerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Plugin code as seen by the guest runtime
#[async_trait]
pub trait PluginProgram: Send + Sync {
    /// Runs once while the code is loaded; an error rejects the code
    async fn initialize(&self, _endowments: &Endowments) -> Result<(), String> {
        Ok(())
    }

    async fn handle(&self, ctx: &GuestContext, request: GuestRequest) -> Result<Value, RpcErrorObject>;
}

/// Turns source text into a runnable program
pub trait ProgramLoader: Send + Sync {
    fn load(&self, source: &str) -> Result<Arc<dyn PluginProgram>, String>;
}

/// What plugin code can reach from inside the sandbox
#[derive(Clone)]
pub struct GuestContext {
    endowments: Arc<Endowments>,
    console: ChannelSender,
    host: Arc<OnceLock<Weak<RpcChannel>>>,
    cancel: CancellationToken,
}

impl GuestContext {
    pub fn endowments(&self) -> &Endowments {
        &self.endowments
    }

    /// Cancelled when the host abandons the current invocation
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Write one line to the host's console log
    pub async fn log(&self, line: &str) {
        if let Err(e) = self.console.send(Bytes::copy_from_slice(line.as_bytes())).await {
            trace!("console line dropped: {}", e);
        }
    }

    /// Call into the host. Fails without leaving the sandbox when no endowment covers
    /// the method's namespace.
    pub async fn host_call(&self, method: &str, params: Value) -> Result<Value, RpcErrorObject> {
        if !self.endowments.allows_host_call(method) {
            return Err(RpcErrorObject::unauthorized(capability_for_host_call(method)));
        }

        let channel = self
            .host
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| RpcErrorObject::internal("host link is not available"))?;

        match channel.request(method, params).await {
            Ok(value) => Ok(value),
            Err(RpcError::Remote(error)) => Err(error),
            Err(other) => Err(RpcErrorObject::internal(other.to_string())),
        }
    }
}

struct ControlHandler;

#[async_trait]
impl InboundHandler for ControlHandler {
    async fn handle_request(
        &self,
        _id: &RequestId,
        method: &str,
        _params: Value,
    ) -> Result<Value, RpcErrorObject> {
        match method {
            PING_METHOD => Ok(json!("pong")),
            other => Err(RpcErrorObject::method_not_found(other)),
        }
    }
}

struct InvokeHandler {
    program: Arc<dyn PluginProgram>,
    endowments: Arc<Endowments>,
    console: ChannelSender,
    host: Arc<OnceLock<Weak<RpcChannel>>>,
    running: Mutex<HashMap<RequestId, CancellationToken>>,
}

impl InvokeHandler {
    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, CancellationToken>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl InboundHandler for InvokeHandler {
    async fn handle_request(
        &self,
        id: &RequestId,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcErrorObject> {
        if method != INVOKE_METHOD {
            return Err(RpcErrorObject::method_not_found(method));
        }
        let request: GuestRequest = serde_json::from_value(params)
            .map_err(|e| RpcErrorObject::invalid_params(e.to_string()))?;

        let cancel = CancellationToken::new();
        self.running().insert(id.clone(), cancel.clone());

        let ctx = GuestContext {
            endowments: Arc::clone(&self.endowments),
            console: self.console.clone(),
            host: Arc::clone(&self.host),
            cancel: cancel.clone(),
        };

        let outcome = tokio::select! {
            outcome = self.program.handle(&ctx, request) => outcome,
            _ = cancel.cancelled() => {
                debug!(%id, "invocation cancelled by host");
                Err(RpcErrorObject::cancelled())
            }
        };

        self.running().remove(id);
        outcome
    }

    async fn handle_notification(&self, method: &str, params: Value) {
        if method != CANCEL_METHOD {
            return;
        }
        let Some(id) = params
            .get("id")
            .cloned()
            .and_then(|raw| serde_json::from_value::<RequestId>(raw).ok())
        else {
            return;
        };
        if let Some(token) = self.running().get(&id) {
            token.cancel();
        }
    }
}

pub struct GuestRuntime {
    program: Arc<dyn PluginProgram>,
    endowments: Endowments,
    max_payload: usize,
    max_violations: u32,
}

impl GuestRuntime {
    pub fn new(program: Arc<dyn PluginProgram>, endowments: Endowments) -> Self {
        Self {
            program,
            endowments,
            max_payload: 64 * 1024,
            max_violations: 16,
        }
    }

    pub fn with_limits(mut self, max_payload: usize, max_violations: u32) -> Self {
        self.max_payload = max_payload;
        self.max_violations = max_violations;
        self
    }

    /// Serve the host over `stream` until the transport closes or `shutdown` fires
    pub async fn run(self, stream: ByteStream, shutdown: CancellationToken) -> Result<(), MuxError> {
        let violations = Arc::new(ViolationTracker::new(self.max_violations));
        let mux = Multiplexer::new(stream, self.max_payload, Arc::clone(&violations));

        let control = mux.open_channel(CONTROL_CHANNEL)?;
        let rpc = mux.open_channel(RPC_CHANNEL)?;
        let (console, _console_rx) = mux.open_channel(CONSOLE_CHANNEL)?.split();

        let host = Arc::new(OnceLock::new());
        let invoke = Arc::new(InvokeHandler {
            program: self.program,
            endowments: Arc::new(self.endowments),
            console,
            host: Arc::clone(&host),
            running: Mutex::new(HashMap::new()),
        });

        let _control = RpcChannel::new(control, Arc::clone(&violations), Some(Arc::new(ControlHandler)));
        let rpc = Arc::new(RpcChannel::new(rpc, Arc::clone(&violations), Some(invoke)));
        let _ = host.set(Arc::downgrade(&rpc));

        mux.start()?;
        debug!("guest runtime serving");

        let closed = mux.closed();
        let tripped = violations.tripped();
        tokio::select! {
            _ = shutdown.cancelled() => debug!("guest runtime shut down"),
            _ = closed.cancelled() => debug!("guest transport closed"),
            _ = tripped.cancelled() => debug!("guest violation limit exceeded"),
        }

        mux.shutdown();
        Ok(())
    }

    /// Serve over the process's stdin/stdout, for worker binaries driven by the
    /// process adapter
    pub async fn serve_stdio(self, shutdown: CancellationToken) -> Result<(), MuxError> {
        let stream = ByteStream::new(tokio::io::stdin(), tokio::io::stdout());
        self.run(stream, shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::codes;
    use std::time::Duration;

    struct Scripted;

    #[async_trait]
    impl PluginProgram for Scripted {
        async fn handle(&self, ctx: &GuestContext, request: GuestRequest) -> Result<Value, RpcErrorObject> {
            match request.method.as_str() {
                "echo" => Ok(request.params),
                "hang" => {
                    ctx.cancellation().cancelled().await;
                    Ok(Value::Null)
                }
                "store" => ctx.host_call("storage.set", request.params).await,
                other => Err(RpcErrorObject::method_not_found(other)),
            }
        }
    }

    struct Host {
        _mux: Multiplexer,
        control: RpcChannel,
        rpc: RpcChannel,
    }

    fn spawn_guest() -> (Host, CancellationToken) {
        let (host_end, guest_end) = tokio::io::duplex(4096);
        let shutdown = CancellationToken::new();
        let runtime = GuestRuntime::new(Arc::new(Scripted), Endowments::default());
        tokio::spawn(runtime.run(ByteStream::from_duplex(guest_end), shutdown.clone()));

        let violations = Arc::new(ViolationTracker::new(4));
        let mux = Multiplexer::new(ByteStream::from_duplex(host_end), 1024, Arc::clone(&violations));
        let control = RpcChannel::new(mux.open_channel(CONTROL_CHANNEL).unwrap(), Arc::clone(&violations), None);
        let rpc = RpcChannel::new(mux.open_channel(RPC_CHANNEL).unwrap(), violations, None);
        mux.start().unwrap();
        (Host { _mux: mux, control, rpc }, shutdown)
    }

    fn invoke_params(method: &str, params: Value) -> Value {
        serde_json::to_value(GuestRequest {
            handler: HandlerKind::Rpc,
            origin: None,
            method: method.to_string(),
            params,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_ping_and_invoke() {
        let (host, _shutdown) = spawn_guest();
        assert_eq!(host.control.request(PING_METHOD, Value::Null).await.unwrap(), json!("pong"));
        let result = host
            .rpc
            .request(INVOKE_METHOD, invoke_params("echo", json!([1, 2])))
            .await
            .unwrap();
        assert_eq!(result, json!([1, 2]));
    }

    #[tokio::test]
    async fn test_cancel_notification_aborts_invocation() {
        let (host, _shutdown) = spawn_guest();
        let call = host
            .rpc
            .call(INVOKE_METHOD, invoke_params("hang", Value::Null), None)
            .await
            .unwrap();
        host.rpc.cancel(call.id()).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), call.wait()).await.unwrap();
        match outcome {
            Err(RpcError::Remote(error)) => assert_eq!(error.code, codes::REQUEST_CANCELLED),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_host_call_without_endowment_stays_in_sandbox() {
        let (host, _shutdown) = spawn_guest();
        let outcome = host
            .rpc
            .request(INVOKE_METHOD, invoke_params("store", json!({"k": 1})))
            .await;
        match outcome {
            Err(RpcError::Remote(error)) => assert_eq!(error.code, codes::UNAUTHORIZED),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_transport() {
        let (host, shutdown) = spawn_guest();
        host.control.request(PING_METHOD, Value::Null).await.unwrap();
        let closed = host._mux.closed();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), closed.cancelled())
            .await
            .unwrap();
    }
}
