//! RPC channel over one multiplexer channel.
//!
//! Outbound calls register a pending entry keyed by request id; a dedicated reader
//! loop matches responses to entries in whatever order they arrive. Inbound requests
//! are handed to an [`InboundHandler`] on their own task so a slow handler never
//! stalls the reader.

use super::{RequestId, RpcError, RpcErrorObject, RpcMessage};
use crate::mux::{ChannelReceiver, ChannelSender, MuxChannel, ViolationTracker};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Notification sent when a caller abandons an in-flight request
pub const CANCEL_METHOD: &str = "$/cancelRequest";

/// Handles requests and notifications initiated by the other side of the channel
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_request(
        &self,
        id: &RequestId,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcErrorObject>;

    async fn handle_notification(&self, _method: &str, _params: Value) {}
}

/// Holds one unit of an in-flight counter; released on drop
#[derive(Debug)]
pub struct BusyGuard {
    counter: Arc<AtomicUsize>,
}

impl BusyGuard {
    pub fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

struct PendingEntry {
    tx: oneshot::Sender<Result<Value, RpcError>>,
    // Released only when the response arrives or the channel is torn down.
    _guard: Option<BusyGuard>,
}

struct RpcShared {
    name: String,
    sender: ChannelSender,
    pending: Mutex<HashMap<RequestId, PendingEntry>>,
    next_id: AtomicU64,
    closed: CancellationToken,
    violations: Arc<ViolationTracker>,
}

impl RpcShared {
    fn pending(&self) -> MutexGuard<'_, HashMap<RequestId, PendingEntry>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn write(&self, message: &RpcMessage) -> Result<(), RpcError> {
        let bytes = message.to_bytes()?;
        self.sender
            .send(bytes)
            .await
            .map_err(|_| RpcError::Disconnected)
    }

    fn fail_all_pending(&self) {
        let drained: Vec<(RequestId, PendingEntry)> = self.pending().drain().collect();
        if !drained.is_empty() {
            debug!(channel = %self.name, count = drained.len(), "failing pending calls");
        }
        for (_, entry) in drained {
            let _ = entry.tx.send(Err(RpcError::Disconnected));
        }
    }
}

/// A request that has been written to the channel
#[derive(Debug)]
pub struct PendingCall {
    id: RequestId,
    rx: oneshot::Receiver<Result<Value, RpcError>>,
}

impl PendingCall {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the matching response
    pub async fn wait(self) -> Result<Value, RpcError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Disconnected),
        }
    }
}

/// Request/response/notification endpoint over one mux channel
pub struct RpcChannel {
    shared: Arc<RpcShared>,
}

impl RpcChannel {
    pub fn new(
        channel: MuxChannel,
        violations: Arc<ViolationTracker>,
        handler: Option<Arc<dyn InboundHandler>>,
    ) -> Self {
        let name = channel.name().to_string();
        let (sender, receiver) = channel.split();
        let shared = Arc::new(RpcShared {
            name,
            sender,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
            violations,
        });

        tokio::spawn(reader_loop(receiver, Arc::clone(&shared), handler));
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Write a request and return a handle for its response. The optional guard is
    /// held until the response arrives or the channel closes, even if the caller
    /// stops waiting.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        guard: Option<BusyGuard>,
    ) -> Result<PendingCall, RpcError> {
        if self.shared.closed.is_cancelled() {
            return Err(RpcError::Disconnected);
        }

        let id = RequestId::Number(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending()
            .insert(id.clone(), PendingEntry { tx, _guard: guard });

        let message = RpcMessage::request(id.clone(), method, params);
        if let Err(e) = self.shared.write(&message).await {
            self.shared.pending().remove(&id);
            return Err(e);
        }

        trace!(channel = %self.shared.name, %id, method, "request sent");
        Ok(PendingCall { id, rx })
    }

    /// Call and wait for the response
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.call(method, params, None).await?.wait().await
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        if self.shared.closed.is_cancelled() {
            return Err(RpcError::Disconnected);
        }
        self.shared
            .write(&RpcMessage::notification(method, params))
            .await
    }

    /// Best-effort cancellation notice; the pending entry stays until the peer answers
    pub async fn cancel(&self, id: &RequestId) -> Result<(), RpcError> {
        debug!(channel = %self.shared.name, %id, "cancelling request");
        self.notify(CANCEL_METHOD, json!({ "id": id })).await
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending().len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Cancelled once the reader loop has stopped
    pub fn closed(&self) -> CancellationToken {
        self.shared.closed.clone()
    }

    pub async fn close(&self) {
        self.shared.closed.cancel();
        self.shared.sender.close().await;
        self.shared.fail_all_pending();
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("name", &self.shared.name)
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn reader_loop(
    mut receiver: ChannelReceiver,
    shared: Arc<RpcShared>,
    handler: Option<Arc<dyn InboundHandler>>,
) {
    loop {
        let bytes = tokio::select! {
            _ = shared.closed.cancelled() => break,
            bytes = receiver.recv() => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
        };

        let message = match RpcMessage::parse(&bytes) {
            Ok(message) => message,
            Err(e) => {
                shared.violations.record(&shared.name, &e.to_string());
                continue;
            }
        };

        match message {
            RpcMessage::Response { id, outcome } => {
                let entry = shared.pending().remove(&id);
                match entry {
                    Some(entry) => {
                        trace!(channel = %shared.name, %id, "response matched");
                        let _ = entry.tx.send(outcome.map_err(RpcError::Remote));
                    }
                    None => {
                        shared
                            .violations
                            .record(&shared.name, &format!("response for unknown id {}", id));
                    }
                }
            }
            RpcMessage::Request { id, method, params } => {
                let shared = Arc::clone(&shared);
                let handler = handler.clone();
                tokio::spawn(async move {
                    let outcome = match handler {
                        Some(handler) => handler.handle_request(&id, &method, params).await,
                        None => Err(RpcErrorObject::method_not_found(&method)),
                    };
                    if let Err(e) = shared.write(&RpcMessage::response(id, outcome)).await {
                        debug!(channel = %shared.name, "dropping response: {}", e);
                    }
                });
            }
            RpcMessage::Notification { method, params } => {
                if let Some(handler) = &handler {
                    handler.handle_notification(&method, params).await;
                } else {
                    trace!(channel = %shared.name, method = %method, "unhandled notification");
                }
            }
        }
    }

    if !shared.closed.is_cancelled() {
        warn!(channel = %shared.name, "rpc channel closed by transport");
    }
    shared.closed.cancel();
    shared.fail_all_pending();
}
