mod common;

use async_trait::async_trait;
use common::{descriptor, test_config, wait_for_event};
use plughost::execution::{
    AdapterError, AdapterKind, ContextId, CrashNotice, Endowments, ExecutionContextAdapter, PING_METHOD,
};
use plughost::mux::{ByteStream, MuxChannel, Multiplexer, ViolationTracker};
use plughost::rpc::{InboundHandler, RequestId, RpcChannel, RpcErrorObject};
use plughost::{ErrorKind, InvokeRequest, PluginController, PluginEvent, PluginStatus};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

struct Pong;

#[async_trait]
impl InboundHandler for Pong {
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

/// Guest end driven by the test: the control channel answers pings, the rpc channel
/// is handed to the test untouched
struct ScriptedGuest {
    _mux: Multiplexer,
    _control: RpcChannel,
    rpc: Option<MuxChannel>,
}

struct ScriptedAdapter {
    guests: Mutex<HashMap<ContextId, ScriptedGuest>>,
    crashes: broadcast::Sender<CrashNotice>,
    max_payload: usize,
}

impl ScriptedAdapter {
    fn new(max_payload: usize) -> Self {
        let (crashes, _) = broadcast::channel(8);
        Self {
            guests: Mutex::new(HashMap::new()),
            crashes,
            max_payload,
        }
    }

    async fn take_rpc(&self) -> MuxChannel {
        let mut guests = self.guests.lock().await;
        guests
            .values_mut()
            .find_map(|guest| guest.rpc.take())
            .expect("a connected guest")
    }
}

#[async_trait]
impl ExecutionContextAdapter for ScriptedAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::InProcess
    }

    async fn create(&self) -> Result<ContextId, AdapterError> {
        Ok(ContextId::new())
    }

    async fn load_code(&self, _id: ContextId, _code: &str, _endowments: &Endowments) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn open_stream(&self, id: ContextId) -> Result<ByteStream, AdapterError> {
        let (host_end, guest_end) = tokio::io::duplex(64 * 1024);
        let mux = Multiplexer::new(
            ByteStream::from_duplex(guest_end),
            self.max_payload,
            Arc::new(ViolationTracker::new(8)),
        );
        let stream_error = |e: plughost::mux::MuxError| AdapterError::Stream(e.to_string());
        let control = RpcChannel::new(
            mux.open_channel("control").map_err(stream_error)?,
            mux.violations(),
            Some(Arc::new(Pong)),
        );
        let rpc = mux.open_channel("rpc").map_err(stream_error)?;
        mux.start().map_err(stream_error)?;

        self.guests.lock().await.insert(
            id,
            ScriptedGuest {
                _mux: mux,
                _control: control,
                rpc: Some(rpc),
            },
        );
        Ok(ByteStream::from_duplex(host_end))
    }

    async fn destroy(&self, id: ContextId) -> Result<(), AdapterError> {
        self.guests.lock().await.remove(&id);
        Ok(())
    }

    fn subscribe_crashes(&self) -> broadcast::Receiver<CrashNotice> {
        self.crashes.subscribe()
    }
}

fn scripted() -> (PluginController, Arc<ScriptedAdapter>) {
    let config = test_config();
    let adapter = Arc::new(ScriptedAdapter::new(config.execution.max_frame_payload));
    let controller = PluginController::builder(config)
        .adapter(adapter.clone())
        .build()
        .expect("controller builds");
    (controller, adapter)
}

async fn active_invocations(controller: &PluginController, id: &str) -> usize {
    controller.get_state(id).await.unwrap().active_invocations
}

#[tokio::test]
async fn test_guest_closing_rpc_channel_stops_plugin() {
    let (controller, adapter) = scripted();
    controller.install(descriptor("npm:quiet", "1.0.0")).await.unwrap();
    controller.start("npm:quiet").await.unwrap();
    let mut events = controller.subscribe_events();

    let (sender, _receiver) = adapter.take_rpc().await.split();
    sender.close().await;

    let crashed = wait_for_event(&mut events, |e| matches!(e, PluginEvent::Crashed { .. })).await;
    match crashed {
        PluginEvent::Crashed { plugin_id, reason } => {
            assert_eq!(plugin_id, "npm:quiet");
            assert!(reason.contains("rpc channel closed"), "{}", reason);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let state = controller.get_state("npm:quiet").await.unwrap();
    assert_eq!(state.status, PluginStatus::Stopped);
    assert_eq!(state.last_error.map(|e| e.kind), Some(ErrorKind::Disconnected));
    assert!(!controller.execution().has_handle("npm:quiet").await);

    let err = controller
        .invoke("npm:quiet", InvokeRequest::rpc("echo", json!(1)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotRunning);
}

#[tokio::test]
async fn test_busy_counter_outlives_cancelled_caller() {
    let (controller, adapter) = scripted();
    controller.install(descriptor("npm:mute", "1.0.0")).await.unwrap();
    controller.start("npm:mute").await.unwrap();
    // Requests reach the guest but are never answered and cancel notices are ignored.
    let _rpc = adapter.take_rpc().await;

    let cancel = CancellationToken::new();
    let call = {
        let controller = controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            controller
                .invoke_with_cancel("npm:mute", InvokeRequest::rpc("echo", json!(1)), cancel)
                .await
        })
    };

    let deadline = Instant::now() + Duration::from_secs(2);
    while active_invocations(&controller, "npm:mute").await != 1 {
        assert!(Instant::now() < deadline, "request never dispatched");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    cancel.cancel();
    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    // The context still owes a response, so the request still counts.
    assert_eq!(active_invocations(&controller, "npm:mute").await, 1);
    let info = controller.execution().handle_info("npm:mute").await.unwrap();
    assert_eq!(info.busy, 1);
    assert_eq!(
        controller.get_state("npm:mute").await.unwrap().status,
        PluginStatus::Running
    );

    controller.stop("npm:mute").await.unwrap();
    assert_eq!(active_invocations(&controller, "npm:mute").await, 0);
}
