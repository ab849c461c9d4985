// Sandboxed Plugin Host Library
//
// Runs untrusted plugin code in isolated execution contexts, talks to each context over
// a multiplexed JSON-RPC connection, and gates everything a plugin does behind
// capability grants with caveats.

pub mod config;
pub mod controller;
pub mod error;
pub mod execution;
pub mod logging;
pub mod mux;
pub mod permissions;
pub mod rpc;

// Re-export commonly used types
pub use config::{AdapterConfig, ConfigError, ExecutionConfig, HostConfig};
pub use controller::{
    ControllerBuilder, HostApi, InvokeRequest, PluginController, PluginDescriptor, PluginEvent,
    PluginRuntimeState, PluginSnapshot, PluginSource, PluginStatus, StateStore,
};
pub use error::{ErrorKind, HostError, HostResult};
pub use execution::{
    ExecutionContextAdapter, ExecutionService, GuestContext, GuestRequest, GuestRuntime,
    HandleInfo, PluginProgram, ProgramLoader,
};
pub use permissions::{
    Caveat, CaveatContext, HandlerKind, Permission, PermissionEngine, PermissionRequest,
    PermissionSet,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
