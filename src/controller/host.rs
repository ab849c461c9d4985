//! Calls from plugin code into the host.
//!
//! The sandbox only holds endowments for capabilities granted when it started, but a
//! grant may have been revoked since. Every host call is therefore checked against the
//! plugin's current grants before it reaches the [`HostApi`].

use super::PluginSlot;
use crate::execution::HostCallRouter;
use crate::permissions::{capability_for_host_call, CaveatContext, PermissionEngine};
use crate::rpc::RpcErrorObject;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Side effects behind each capability; supplied by the embedding application
#[async_trait]
pub trait HostApi: Send + Sync {
    async fn call(&self, plugin_id: &str, method: &str, params: Value) -> Result<Value, RpcErrorObject>;
}

/// Host API that exposes nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHostApi;

#[async_trait]
impl HostApi for NoHostApi {
    async fn call(&self, _plugin_id: &str, method: &str, _params: Value) -> Result<Value, RpcErrorObject> {
        Err(RpcErrorObject::method_not_found(method))
    }
}

pub(crate) struct HostCallHandler {
    plugins: Arc<RwLock<HashMap<String, Arc<PluginSlot>>>>,
    engine: Arc<PermissionEngine>,
    api: Arc<dyn HostApi>,
}

impl HostCallHandler {
    pub(crate) fn new(
        plugins: Arc<RwLock<HashMap<String, Arc<PluginSlot>>>>,
        engine: Arc<PermissionEngine>,
        api: Arc<dyn HostApi>,
    ) -> Self {
        Self { plugins, engine, api }
    }
}

#[async_trait]
impl HostCallRouter for HostCallHandler {
    async fn route(&self, plugin_id: &str, method: &str, params: Value) -> Result<Value, RpcErrorObject> {
        let capability = capability_for_host_call(method);
        let slot = self
            .plugins
            .read()
            .await
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| RpcErrorObject::unauthorized(capability))?;

        let ctx = CaveatContext::for_host_call(method, &params);
        let allowed = {
            let record = slot.record.read().await;
            record.state.status.is_live()
                && self
                    .engine
                    .is_granted(plugin_id, &record.state.granted, capability, &ctx)
        };
        if !allowed {
            warn!(plugin_id, method, capability, "host call rejected");
            return Err(RpcErrorObject::unauthorized(capability));
        }

        debug!(plugin_id, method, "host call");
        self.api.call(plugin_id, method, params).await
    }
}
