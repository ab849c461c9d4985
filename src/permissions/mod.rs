//! Permission Engine
//!
//! Decides which capabilities a plugin holds and whether one request may use them.
//! Grants live in the controller's runtime record; the engine itself is stateless apart
//! from the [`ApprovalPolicy`] that answers new requests.

pub mod caveat;

pub use caveat::{Caveat, CaveatContext};

use crate::config::PermissionConfig;
use crate::error::{HostError, HostResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A capability requested by a plugin manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub capability: String,
    #[serde(default)]
    pub caveats: Vec<Caveat>,
}

impl PermissionRequest {
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            caveats: Vec::new(),
        }
    }

    pub fn with_caveat(mut self, caveat: Caveat) -> Self {
        self.caveats.push(caveat);
        self
    }
}

/// A granted capability and the caveats narrowing it; caveats are conjunctive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub capability: String,
    #[serde(default)]
    pub caveats: Vec<Caveat>,
    pub granted_at: chrono::DateTime<chrono::Utc>,
}

impl Permission {
    pub fn permits(&self, ctx: &CaveatContext) -> bool {
        self.caveats.iter().all(|caveat| caveat.permits(ctx))
    }

    pub fn max_request_time(&self) -> Option<Duration> {
        self.caveats.iter().filter_map(Caveat::max_request_time).min()
    }
}

impl From<&PermissionRequest> for Permission {
    fn from(request: &PermissionRequest) -> Self {
        Self {
            capability: request.capability.clone(),
            caveats: request.caveats.clone(),
            granted_at: chrono::Utc::now(),
        }
    }
}

/// Granted permissions keyed by capability name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet {
    grants: BTreeMap<String, Permission>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, permission: Permission) -> Option<Permission> {
        self.grants.insert(permission.capability.clone(), permission)
    }

    pub fn remove(&mut self, capability: &str) -> Option<Permission> {
        self.grants.remove(capability)
    }

    pub fn get(&self, capability: &str) -> Option<&Permission> {
        self.grants.get(capability)
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.grants.contains_key(capability)
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.grants.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.grants.values()
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

/// Entry points a host can invoke on a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Rpc,
    Cronjob,
    Lifecycle,
    Transaction,
}

impl HandlerKind {
    /// Capability a plugin must hold before the handler may be invoked
    pub fn capability(&self) -> &'static str {
        match self {
            HandlerKind::Rpc => "endowment:rpc",
            HandlerKind::Cronjob => "endowment:cronjob",
            HandlerKind::Lifecycle => "endowment:lifecycle-hooks",
            HandlerKind::Transaction => "endowment:transaction-insight",
        }
    }

    pub fn from_capability(capability: &str) -> Option<Self> {
        [
            HandlerKind::Rpc,
            HandlerKind::Cronjob,
            HandlerKind::Lifecycle,
            HandlerKind::Transaction,
        ]
        .into_iter()
        .find(|kind| kind.capability() == capability)
    }
}

/// Capability a host call needs, taken from its namespace (`storage.get` needs `storage`)
pub fn capability_for_host_call(method: &str) -> &str {
    method.split_once('.').map_or(method, |(namespace, _)| namespace)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Grant,
    /// Leave the request pending until the host approves it explicitly
    Defer,
    Deny,
}

/// Answers permission requests that no prior grant covers
pub trait ApprovalPolicy: Send + Sync {
    fn decide(&self, plugin_id: &str, request: &PermissionRequest) -> ApprovalDecision;
}

/// Approval driven by the `[permissions]` configuration section
#[derive(Debug, Clone, Default)]
pub struct ConfigApprovalPolicy {
    auto_approve: HashSet<String>,
    deny: HashSet<String>,
}

impl ConfigApprovalPolicy {
    pub fn new(config: &PermissionConfig) -> Self {
        Self {
            auto_approve: config.auto_approve.iter().cloned().collect(),
            deny: config.deny.iter().cloned().collect(),
        }
    }
}

impl ApprovalPolicy for ConfigApprovalPolicy {
    fn decide(&self, _plugin_id: &str, request: &PermissionRequest) -> ApprovalDecision {
        if self.deny.contains(&request.capability) {
            ApprovalDecision::Deny
        } else if self.auto_approve.contains(&request.capability) {
            ApprovalDecision::Grant
        } else {
            ApprovalDecision::Defer
        }
    }
}

/// Outcome of authorizing a set of requests
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Authorization {
    pub granted: PermissionSet,
    pub pending: Vec<PermissionRequest>,
    /// Previously granted capabilities that the new request set dropped
    pub revoked: Vec<String>,
}

pub struct PermissionEngine {
    policy: Arc<dyn ApprovalPolicy>,
}

impl PermissionEngine {
    pub fn new(policy: Arc<dyn ApprovalPolicy>) -> Self {
        Self { policy }
    }

    pub fn from_config(config: &PermissionConfig) -> Self {
        Self::new(Arc::new(ConfigApprovalPolicy::new(config)))
    }

    /// Whether `grants` cover `capability` for the request described by `ctx`
    pub fn is_granted(
        &self,
        plugin_id: &str,
        grants: &PermissionSet,
        capability: &str,
        ctx: &CaveatContext,
    ) -> bool {
        let granted = grants
            .get(capability)
            .map_or(false, |permission| permission.permits(ctx));
        if !granted {
            debug!(plugin_id, capability, "capability check failed");
        }
        granted
    }

    /// Like [`PermissionEngine::is_granted`] but fails with `PermissionDenied`
    pub fn check(
        &self,
        plugin_id: &str,
        grants: &PermissionSet,
        capability: &str,
        ctx: &CaveatContext,
    ) -> HostResult<()> {
        if self.is_granted(plugin_id, grants, capability, ctx) {
            Ok(())
        } else {
            Err(HostError::permission_denied(plugin_id, capability))
        }
    }

    /// Authorize a fresh set of requests, as on install
    pub fn authorize(
        &self,
        plugin_id: &str,
        requests: &[PermissionRequest],
    ) -> HostResult<Authorization> {
        self.reauthorize(plugin_id, &PermissionSet::new(), requests)
    }

    /// Authorize a new request set against existing grants, as on update. Grants
    /// re-requested with identical caveats carry over; new or changed requests go to the
    /// policy; grants not re-requested are revoked.
    pub fn reauthorize(
        &self,
        plugin_id: &str,
        current: &PermissionSet,
        requests: &[PermissionRequest],
    ) -> HostResult<Authorization> {
        let mut authorization = Authorization::default();

        for request in requests {
            for caveat in &request.caveats {
                caveat.validate().map_err(|reason| {
                    HostError::InvalidDescriptor(format!("{}: {}", request.capability, reason))
                })?;
            }

            if let Some(existing) = current.get(&request.capability) {
                if existing.caveats == request.caveats {
                    authorization.granted.insert(existing.clone());
                    continue;
                }
            }

            match self.policy.decide(plugin_id, request) {
                ApprovalDecision::Grant => {
                    authorization.granted.insert(Permission::from(request));
                }
                ApprovalDecision::Defer => authorization.pending.push(request.clone()),
                ApprovalDecision::Deny => {
                    info!(plugin_id, capability = %request.capability, "permission denied by policy");
                    return Err(HostError::permission_denied(plugin_id, &request.capability));
                }
            }
        }

        authorization.revoked = current
            .capabilities()
            .into_iter()
            .filter(|capability| !authorization.granted.contains(capability))
            .collect();

        debug!(
            plugin_id,
            granted = authorization.granted.len(),
            pending = authorization.pending.len(),
            revoked = authorization.revoked.len(),
            "authorized permission requests"
        );
        Ok(authorization)
    }

    /// Tightest `MaxRequestTime` caveat on any of the given capabilities
    pub fn max_request_time(grants: &PermissionSet, capabilities: &[&str]) -> Option<Duration> {
        capabilities
            .iter()
            .filter_map(|capability| grants.get(capability))
            .filter_map(Permission::max_request_time)
            .min()
    }
}

impl std::fmt::Debug for PermissionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionEngine").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn engine(auto: &[&str], deny: &[&str]) -> PermissionEngine {
        PermissionEngine::from_config(&PermissionConfig {
            auto_approve: auto.iter().map(|s| s.to_string()).collect(),
            deny: deny.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn test_authorize_splits_granted_and_pending() {
        let engine = engine(&["network"], &[]);
        let auth = engine
            .authorize(
                "p1",
                &[PermissionRequest::new("network"), PermissionRequest::new("storage")],
            )
            .unwrap();
        assert_eq!(auth.granted.capabilities(), vec!["network".to_string()]);
        assert_eq!(auth.pending, vec![PermissionRequest::new("storage")]);
        assert!(auth.revoked.is_empty());
    }

    #[test]
    fn test_denied_capability_fails_authorization() {
        let engine = engine(&["network"], &["keys"]);
        let err = engine
            .authorize("p1", &[PermissionRequest::new("network"), PermissionRequest::new("keys")])
            .unwrap_err();
        assert!(matches!(err, HostError::PermissionDenied { ref capability, .. } if capability == "keys"));
    }

    #[test]
    fn test_reauthorize_keeps_unchanged_and_revokes_dropped() {
        let engine = engine(&["network", "timers"], &[]);
        let initial = engine
            .authorize("p1", &[PermissionRequest::new("network"), PermissionRequest::new("timers")])
            .unwrap();

        // Neither carried grant goes back through the policy.
        let strict = PermissionEngine::new(Arc::new(ConfigApprovalPolicy::default()));
        let next = strict
            .reauthorize(
                "p1",
                &initial.granted,
                &[PermissionRequest::new("network"), PermissionRequest::new("storage")],
            )
            .unwrap();

        assert!(next.granted.contains("network"));
        assert!(!next.granted.contains("storage"));
        assert_eq!(next.pending.len(), 1);
        assert_eq!(next.revoked, vec!["timers".to_string()]);
    }

    #[test]
    fn test_changed_caveats_require_fresh_approval() {
        let engine = engine(&["network"], &[]);
        let initial = engine.authorize("p1", &[PermissionRequest::new("network")]).unwrap();

        let strict = PermissionEngine::new(Arc::new(ConfigApprovalPolicy::default()));
        let widened = PermissionRequest::new("network")
            .with_caveat(Caveat::AllowedHosts(vec!["*.example.com".to_string()]));
        let next = strict.reauthorize("p1", &initial.granted, &[widened]).unwrap();
        assert!(next.granted.is_empty());
        assert_eq!(next.pending.len(), 1);
        assert_eq!(next.revoked, vec!["network".to_string()]);
    }

    #[test]
    fn test_caveats_are_conjunctive() {
        let engine = engine(&["endowment:rpc"], &[]);
        let request = PermissionRequest::new("endowment:rpc")
            .with_caveat(Caveat::AllowedOrigins(vec!["https://dapp.io".to_string()]))
            .with_caveat(Caveat::AllowedMethods(vec!["hello".to_string()]));
        let grants = engine.authorize("p1", &[request]).unwrap().granted;

        let ok = CaveatContext::new().with_origin("https://dapp.io").with_method("hello");
        let wrong_method = CaveatContext::new().with_origin("https://dapp.io").with_method("bye");
        assert!(engine.is_granted("p1", &grants, "endowment:rpc", &ok));
        assert!(!engine.is_granted("p1", &grants, "endowment:rpc", &wrong_method));
        assert!(engine.check("p1", &grants, "storage", &ok).is_err());
    }

    #[test]
    fn test_invalid_caveat_rejects_descriptor() {
        let engine = engine(&["network"], &[]);
        let request = PermissionRequest::new("network").with_caveat(Caveat::AllowedHosts(vec![]));
        assert!(matches!(
            engine.authorize("p1", &[request]),
            Err(HostError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_max_request_time_and_handler_mapping() {
        let engine = engine(&["endowment:rpc"], &[]);
        let request =
            PermissionRequest::new("endowment:rpc").with_caveat(Caveat::MaxRequestTime(250));
        let grants = engine.authorize("p1", &[request]).unwrap().granted;
        assert_eq!(
            PermissionEngine::max_request_time(&grants, &[HandlerKind::Rpc.capability()]),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            HandlerKind::from_capability("endowment:cronjob"),
            Some(HandlerKind::Cronjob)
        );
        assert_eq!(capability_for_host_call("storage.get"), "storage");
        assert_eq!(capability_for_host_call("random"), "random");
    }
}
