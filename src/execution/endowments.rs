//! Endowments: the concrete bindings a context receives at load time.
//!
//! Built only from granted permissions, so a sandbox never holds a reference to an
//! ungranted capability.

use crate::permissions::{capability_for_host_call, Caveat, HandlerKind, PermissionSet};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Endowment {
    Timers,
    Network {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        allowed_hosts: Option<Vec<String>>,
    },
    Storage,
    Random,
    /// Exported entry point the host may call
    Handler { handler: HandlerKind },
    /// Any other granted capability, exposed by name
    Capability { name: String },
}

impl Endowment {
    /// Capability this binding was derived from
    pub fn capability(&self) -> String {
        match self {
            Endowment::Timers => "timers".to_string(),
            Endowment::Network { .. } => "network".to_string(),
            Endowment::Storage => "storage".to_string(),
            Endowment::Random => "random".to_string(),
            Endowment::Handler { handler } => handler.capability().to_string(),
            Endowment::Capability { name } => name.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endowments {
    bindings: Vec<Endowment>,
}

impl Endowments {
    pub fn from_grants(grants: &PermissionSet) -> Self {
        let bindings = grants
            .iter()
            .map(|permission| match permission.capability.as_str() {
                "timers" => Endowment::Timers,
                "network" => Endowment::Network {
                    allowed_hosts: permission.caveats.iter().find_map(|caveat| match caveat {
                        Caveat::AllowedHosts(hosts) => Some(hosts.clone()),
                        _ => None,
                    }),
                },
                "storage" => Endowment::Storage,
                "random" => Endowment::Random,
                other => match HandlerKind::from_capability(other) {
                    Some(handler) => Endowment::Handler { handler },
                    None => Endowment::Capability {
                        name: other.to_string(),
                    },
                },
            })
            .collect();
        Self { bindings }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endowment> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.bindings.iter().any(|b| b.capability() == capability)
    }

    /// Whether a host call is reachable from inside the sandbox at all
    pub fn allows_host_call(&self, method: &str) -> bool {
        self.has_capability(capability_for_host_call(method))
    }

    pub fn handlers(&self) -> Vec<HandlerKind> {
        self.bindings
            .iter()
            .filter_map(|b| match b {
                Endowment::Handler { handler } => Some(*handler),
                _ => None,
            })
            .collect()
    }
}
