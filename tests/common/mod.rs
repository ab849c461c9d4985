#![allow(dead_code)]

use async_trait::async_trait;
use plughost::config::HostConfig;
use plughost::execution::{GuestContext, GuestRequest, InProcessAdapter, PluginProgram, ProgramLoader};
use plughost::permissions::PermissionRequest;
use plughost::rpc::RpcErrorObject;
use plughost::{PluginController, PluginDescriptor, PluginEvent};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Test program whose behaviour is chosen by the invoked method
pub struct Toolkit;

#[async_trait]
impl PluginProgram for Toolkit {
    async fn handle(&self, ctx: &GuestContext, request: GuestRequest) -> Result<Value, RpcErrorObject> {
        match request.method.as_str() {
            "echo" => Ok(request.params),
            "hang" => {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }
            "sleep" => {
                let ms = request.params["ms"].as_u64().unwrap_or(10);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "slept": ms }))
            }
            "fail" => Err(RpcErrorObject::internal("boom")),
            "host" => {
                let method = request.params["method"].as_str().unwrap_or_default().to_string();
                ctx.host_call(&method, request.params["params"].clone()).await
            }
            "log" => {
                ctx.log("hello from the sandbox").await;
                Ok(json!(true))
            }
            "large" => {
                let len = request.params["len"].as_u64().unwrap_or(0) as usize;
                Ok(json!("x".repeat(len)))
            }
            other => Err(RpcErrorObject::method_not_found(other)),
        }
    }
}

/// `toolkit` loads [`Toolkit`]; any other source is rejected as unparsable
pub struct TestLoader;

impl ProgramLoader for TestLoader {
    fn load(&self, source: &str) -> Result<Arc<dyn PluginProgram>, String> {
        match source.trim() {
            "toolkit" => Ok(Arc::new(Toolkit)),
            other => Err(format!("SyntaxError: unexpected token in {:?}", other)),
        }
    }
}

pub fn test_config() -> HostConfig {
    let mut config = HostConfig::default();
    config.persistence.enabled = false;
    config.permissions.auto_approve = vec![
        "endowment:rpc".to_string(),
        "endowment:cronjob".to_string(),
        "storage".to_string(),
    ];
    config.execution.health_check_interval_ms = 50;
    config
}

pub struct Harness {
    pub controller: PluginController,
    pub adapter: Arc<InProcessAdapter>,
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: HostConfig) -> Harness {
    let adapter = Arc::new(InProcessAdapter::new(Arc::new(TestLoader), &config.execution));
    let controller = PluginController::builder(config)
        .adapter(adapter.clone())
        .build()
        .expect("controller builds");
    Harness { controller, adapter }
}

pub fn descriptor(id: &str, version: &str) -> PluginDescriptor {
    PluginDescriptor::inline(id, version, "toolkit")
        .expect("valid version")
        .with_permission(PermissionRequest::new("endowment:rpc"))
}

/// Wait for the first event matching `pred`, failing the test after two seconds
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<PluginEvent>, pred: F) -> PluginEvent
where
    F: Fn(&PluginEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("event arrives in time")
}
