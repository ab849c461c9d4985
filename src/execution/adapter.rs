//! Execution Context Adapter interface.
//!
//! One implementation per isolation backend. An adapter only allocates sandboxes,
//! ships code into them, exposes their byte stream and tears them down; everything
//! spoken over the stream belongs to the execution service.

use super::endowments::Endowments;
use crate::error::HostError;
use crate::mux::ByteStream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Identifies one sandbox for the lifetime of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    InProcess,
    Process,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("context quota of {0} exhausted")]
    QuotaExceeded(usize),

    #[error("unknown context: {0}")]
    UnknownContext(ContextId),

    #[error("sandbox allocation failed: {0}")]
    Allocation(String),

    #[error("code failed to initialize: {0}")]
    CodeRejected(String),

    #[error("stream unavailable: {0}")]
    Stream(String),

    #[error("teardown failed: {0}")]
    Teardown(String),
}

impl AdapterError {
    /// Map onto the host taxonomy: code faults are the plugin's, everything else is
    /// infrastructure
    pub fn into_host_error(self) -> HostError {
        match self {
            AdapterError::CodeRejected(detail) => HostError::ExecutionError(detail),
            other => HostError::ContextCreationFailed(other.to_string()),
        }
    }
}

/// Unsolicited termination of a sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashNotice {
    pub context_id: ContextId,
    pub reason: String,
}

#[async_trait]
pub trait ExecutionContextAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    /// Allocate an empty sandbox
    async fn create(&self) -> Result<ContextId, AdapterError>;

    /// Ship code and its endowments into the sandbox and run its initialization
    async fn load_code(
        &self,
        id: ContextId,
        code: &str,
        endowments: &Endowments,
    ) -> Result<(), AdapterError>;

    /// Hand out the sandbox's transport; may only be taken once per context
    async fn open_stream(&self, id: ContextId) -> Result<ByteStream, AdapterError>;

    async fn destroy(&self, id: ContextId) -> Result<(), AdapterError>;

    /// Crash notices for contexts that ended without a `destroy`
    fn subscribe_crashes(&self) -> broadcast::Receiver<CrashNotice>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_errors_map_to_host_taxonomy() {
        assert!(matches!(
            AdapterError::CodeRejected("SyntaxError".to_string()).into_host_error(),
            HostError::ExecutionError(detail) if detail == "SyntaxError"
        ));
        assert!(matches!(
            AdapterError::QuotaExceeded(4).into_host_error(),
            HostError::ContextCreationFailed(_)
        ));
    }

    #[test]
    fn test_context_ids_are_unique() {
        let a = ContextId::new();
        let b = ContextId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.as_uuid().to_string());
    }
}
