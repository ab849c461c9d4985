//! Host Error Taxonomy
//!
//! Every public controller operation either succeeds with a typed result or fails with
//! exactly one [`HostError`]. Lower layers (multiplexer, RPC channel, adapters, store,
//! configuration) keep their own error enums and fold into `HostError` through `From`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Main error type returned by the controller and the execution service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("Plugin already installed: {0}")]
    AlreadyInstalled(String),

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin is not running: {0}")]
    NotRunning(String),

    #[error("Permission denied: {plugin_id} lacks {capability}")]
    PermissionDenied { plugin_id: String, capability: String },

    #[error("Execution context creation failed: {0}")]
    ContextCreationFailed(String),

    #[error("Plugin code faulted: {0}")]
    ExecutionError(String),

    #[error("Request timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Execution context disconnected: {0}")]
    Disconnected(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid transition: cannot {operation} while {status}")]
    InvalidTransition { operation: String, status: String },

    #[error("Plugin is blocked: {0}")]
    Blocked(String),

    #[error("Plugin is disabled: {0}")]
    Disabled(String),

    #[error("Invalid plugin descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for host operations
pub type HostResult<T> = Result<T, HostError>;

/// Fieldless discriminant of [`HostError`], used for matching and for `last_error` records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AlreadyInstalled,
    NotFound,
    NotRunning,
    PermissionDenied,
    ContextCreationFailed,
    ExecutionError,
    Timeout,
    Disconnected,
    ProtocolViolation,
    Cancelled,
    InvalidTransition,
    Blocked,
    Disabled,
    InvalidDescriptor,
    Persistence,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::AlreadyInstalled => "already_installed",
            ErrorKind::NotFound => "not_found",
            ErrorKind::NotRunning => "not_running",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::ContextCreationFailed => "context_creation_failed",
            ErrorKind::ExecutionError => "execution_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Disconnected => "disconnected",
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::Blocked => "blocked",
            ErrorKind::Disabled => "disabled",
            ErrorKind::InvalidDescriptor => "invalid_descriptor",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Config => "config",
        };
        f.write_str(name)
    }
}

/// Error recorded in `PluginRuntimeState::last_error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

impl From<&HostError> for ErrorRecord {
    fn from(error: &HostError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            at: chrono::Utc::now(),
        }
    }
}

impl HostError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HostError::AlreadyInstalled(_) => ErrorKind::AlreadyInstalled,
            HostError::NotFound(_) => ErrorKind::NotFound,
            HostError::NotRunning(_) => ErrorKind::NotRunning,
            HostError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            HostError::ContextCreationFailed(_) => ErrorKind::ContextCreationFailed,
            HostError::ExecutionError(_) => ErrorKind::ExecutionError,
            HostError::Timeout { .. } => ErrorKind::Timeout,
            HostError::Disconnected(_) => ErrorKind::Disconnected,
            HostError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            HostError::Cancelled(_) => ErrorKind::Cancelled,
            HostError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            HostError::Blocked(_) => ErrorKind::Blocked,
            HostError::Disabled(_) => ErrorKind::Disabled,
            HostError::InvalidDescriptor(_) => ErrorKind::InvalidDescriptor,
            HostError::Persistence(_) => ErrorKind::Persistence,
            HostError::Config(_) => ErrorKind::Config,
        }
    }

    /// Infrastructure failures force the affected plugin back to `Stopped`
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            HostError::ContextCreationFailed(_)
                | HostError::Disconnected(_)
                | HostError::Timeout { .. }
        )
    }

    pub fn permission_denied(plugin_id: &str, capability: &str) -> Self {
        HostError::PermissionDenied {
            plugin_id: plugin_id.to_string(),
            capability: capability.to_string(),
        }
    }

    pub fn invalid_transition(operation: &str, status: impl fmt::Display) -> Self {
        HostError::InvalidTransition {
            operation: operation.to_string(),
            status: status.to_string(),
        }
    }
}

impl From<crate::config::ConfigError> for HostError {
    fn from(error: crate::config::ConfigError) -> Self {
        HostError::Config(error.to_string())
    }
}

impl From<crate::controller::store::StoreError> for HostError {
    fn from(error: crate::controller::store::StoreError) -> Self {
        HostError::Persistence(error.to_string())
    }
}

impl From<crate::rpc::RpcError> for HostError {
    fn from(error: crate::rpc::RpcError) -> Self {
        use crate::rpc::RpcError;
        match error {
            RpcError::Disconnected => HostError::Disconnected("rpc channel closed".to_string()),
            RpcError::Remote(object) => HostError::ExecutionError(object.to_string()),
            RpcError::Malformed(detail) => HostError::ProtocolViolation(detail),
            RpcError::Encode(detail) => HostError::ProtocolViolation(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        let err = HostError::permission_denied("npm:demo", "storage");
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(err.to_string().contains("storage"));

        let err = HostError::Timeout {
            operation: "invoke".to_string(),
            timeout_ms: 100,
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_infrastructure());
        assert!(!HostError::ExecutionError("boom".to_string()).is_infrastructure());
    }

    #[test]
    fn test_error_record_captures_kind() {
        let err = HostError::Disconnected("context exited".to_string());
        let record = ErrorRecord::from(&err);
        assert_eq!(record.kind, ErrorKind::Disconnected);
        assert!(record.message.contains("context exited"));
        assert_eq!(record.kind.to_string(), "disconnected");
    }
}
