//! Core bridge infrastructure.

pub mod bridge;
pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod metrics;
pub mod pool;
pub mod proxy;
pub mod reconnect;
pub mod service;

pub use bridge::Bridge;
pub use catalog::ServerCatalog;
pub use config::{
    BridgeConfig, HealthConfig, HttpConfig, InvocationConfig, ProxyConfig, ServerConfig,
    ServerDefinition, ServerEdit, ServerId, ServerStatus, StdioConfig, TransportConfig,
    TransportKind,
};
pub use dispatcher::{
    Dispatcher, FailureKind, InvocationFailure, InvocationOutput, InvocationResult,
};
pub use metrics::{BridgeMetrics, LatencySnapshot, MetricsSnapshot};
pub use pool::{BridgePool, RunScope};
pub use reconnect::ReconnectPolicy;
pub use service::ToolBridge;
