//! Tool-invocation bridge between agent runs and external capability servers.
//!
//! ## Modules
//!
//! - [`core`]: server catalog, per-run bridges and their pool, the
//!   invocation dispatcher and the [`ToolBridge`] service facade
//! - [`transport`]: stdio and HTTP+SSE sessions speaking JSON-RPC
//! - [`inventory`]: discovered capabilities and name resolution
//! - [`health`]: circuit breaker state and the background probe loop
//!
//! ## Shared Types
//!
//! - [`TenantId`] / [`ExecutionContextId`]: budget owner and run scope
//! - [`BudgetProvider`]: remaining tenant spend, checked before dispatch

// Shared types (used across modules)
pub mod error;
pub mod tenant;

// Subsystems
pub mod core;
pub mod health;
pub mod inventory;
pub mod transport;

pub use core::config;
// Re-export from core
pub use core::{
    Bridge, BridgeConfig, BridgeMetrics, BridgePool, FailureKind, HealthConfig, HttpConfig,
    InvocationConfig, InvocationFailure, InvocationOutput, InvocationResult, LatencySnapshot,
    MetricsSnapshot, ProxyConfig, RunScope, ServerCatalog, ServerConfig, ServerDefinition,
    ServerEdit, ServerId, ServerStatus, StdioConfig, ToolBridge, TransportConfig, TransportKind,
};

pub use error::{BridgeError, BridgeResult};
// Re-export from health
pub use health::{CircuitState, HealthMonitor, HealthSnapshot, HealthTracker};
// Re-export from inventory
pub use inventory::{
    Capability, CapabilityKind, CapabilityRegistry, CapabilitySet, QualifiedCapability,
    ToolAssignment,
};
pub use tenant::{BudgetProvider, ExecutionContextId, StaticBudget, TenantId, UnlimitedBudget};
// Re-export from transport
pub use transport::{CapabilityTransport, ChunkSink, DefaultConnector, TransportConnector};
