use async_trait::async_trait;
use bytes::Bytes;
use plughost::mux::{ByteStream, Multiplexer, ViolationTracker};
use plughost::rpc::{InboundHandler, RequestId, RpcChannel, RpcError, RpcErrorObject};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;

struct Echo;

#[async_trait]
impl InboundHandler for Echo {
    async fn handle_request(
        &self,
        _id: &RequestId,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcErrorObject> {
        match method {
            "echo" => Ok(params),
            "grow" => {
                let len = params["len"].as_u64().unwrap_or(0) as usize;
                Ok(json!("z".repeat(len)))
            }
            other => Err(RpcErrorObject::method_not_found(other)),
        }
    }
}

struct Link {
    host: Multiplexer,
    guest: Multiplexer,
}

fn link(max_payload: usize) -> Link {
    let (host_end, guest_end) = tokio::io::duplex(16 * 1024);
    let host = Multiplexer::new(
        ByteStream::from_duplex(host_end),
        max_payload,
        Arc::new(ViolationTracker::new(4)),
    );
    let guest = Multiplexer::new(
        ByteStream::from_duplex(guest_end),
        max_payload,
        Arc::new(ViolationTracker::new(4)),
    );
    Link { host, guest }
}

#[tokio::test]
async fn test_rpc_over_mux_with_payloads_larger_than_a_frame() {
    let link = link(1024);
    let host_rpc = RpcChannel::new(link.host.open_channel("rpc").unwrap(), link.host.violations(), None);
    let _guest_rpc = RpcChannel::new(
        link.guest.open_channel("rpc").unwrap(),
        link.guest.violations(),
        Some(Arc::new(Echo)),
    );
    link.host.start().unwrap();
    link.guest.start().unwrap();

    let blob = "a".repeat(200_000);
    let out = host_rpc.request("echo", json!({ "blob": blob })).await.unwrap();
    assert_eq!(out["blob"].as_str().map(str::len), Some(200_000));

    let out = host_rpc.request("grow", json!({ "len": 500_000 })).await.unwrap();
    assert_eq!(out.as_str().map(str::len), Some(500_000));

    assert_eq!(link.host.violations().count(), 0);
    assert_eq!(link.guest.violations().count(), 0);
    assert_eq!(host_rpc.pending_count(), 0);
}

#[tokio::test]
async fn test_interleaved_channels_keep_messages_apart() {
    let link = link(512);
    let host_rpc = Arc::new(RpcChannel::new(
        link.host.open_channel("rpc").unwrap(),
        link.host.violations(),
        None,
    ));
    let _guest_rpc = RpcChannel::new(
        link.guest.open_channel("rpc").unwrap(),
        link.guest.violations(),
        Some(Arc::new(Echo)),
    );
    let host_console = link.host.open_channel("console").unwrap();
    let mut guest_console = link.guest.open_channel("console").unwrap();
    link.host.start().unwrap();
    link.guest.start().unwrap();

    let calls: Vec<_> = (0..10)
        .map(|i| {
            let rpc = Arc::clone(&host_rpc);
            tokio::spawn(async move {
                let payload = format!("{}", i).repeat(5_000);
                let out = rpc.request("echo", json!(payload.clone())).await.unwrap();
                assert_eq!(out, json!(payload));
            })
        })
        .collect();

    let lines: Vec<Bytes> = (0..20)
        .map(|i| Bytes::from(format!("line {} {}", i, "-".repeat(1_000))))
        .collect();
    for line in &lines {
        host_console.send(line.clone()).await.unwrap();
    }
    for line in &lines {
        assert_eq!(guest_console.recv().await.as_ref(), Some(line));
    }

    for call in calls {
        call.await.unwrap();
    }
}

#[tokio::test]
async fn test_closing_transport_fails_pending_calls() {
    let link = link(1024);
    let host_rpc = RpcChannel::new(link.host.open_channel("rpc").unwrap(), link.host.violations(), None);
    // The guest never answers: its channel exists but nothing reads requests.
    let _guest_channel = link.guest.open_channel("rpc").unwrap();
    link.host.start().unwrap();
    link.guest.start().unwrap();

    let call = host_rpc.call("echo", json!(1), None).await.unwrap();
    link.guest.shutdown();
    drop(link.guest);

    assert!(matches!(call.wait().await, Err(RpcError::Disconnected)));
}
