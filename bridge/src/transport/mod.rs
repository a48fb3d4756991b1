//! Transport clients for capability servers.
//!
//! ## Transports
//!
//! - [`stdio`]: child process, newline-delimited JSON-RPC over stdin/stdout
//! - [`http`]: HTTP POST with JSON or Server-Sent Events responses, resumable
//!   via `Last-Event-ID`
//!
//! Both sit behind [`CapabilityTransport`]; [`DefaultConnector`] picks one
//! from the server's [`TransportConfig`].

pub mod http;
pub mod protocol;
pub mod stdio;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

pub use http::HttpSseTransport;
pub use stdio::StdioTransport;

use crate::{
    core::config::{BridgeConfig, ProxyConfig, ServerConfig, ServerId, TransportConfig, TransportKind},
    error::BridgeResult,
    inventory::CapabilitySet,
};

/// Collects incremental chunks (progress notifications, streamed events)
/// received while a call is in flight.
///
/// Owned by the caller so partial output survives a timeout.
#[derive(Debug, Clone, Default)]
pub struct ChunkSink {
    chunks: Arc<Mutex<Vec<Value>>>,
}

impl ChunkSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, chunk: Value) {
        self.chunks.lock().push(chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.chunks.lock().clone()
    }

    pub fn take(&self) -> Vec<Value> {
        std::mem::take(&mut *self.chunks.lock())
    }
}

/// An open session with one capability server.
#[async_trait]
pub trait CapabilityTransport: Send + Sync {
    fn server_id(&self) -> &ServerId;

    fn kind(&self) -> TransportKind;

    async fn list_capabilities(&self) -> BridgeResult<CapabilitySet>;

    async fn invoke_tool(&self, name: &str, arguments: Value, sink: &ChunkSink)
        -> BridgeResult<Value>;

    async fn read_resource(&self, uri: &str, sink: &ChunkSink) -> BridgeResult<Value>;

    async fn get_prompt(&self, name: &str, arguments: Value, sink: &ChunkSink)
        -> BridgeResult<Value>;

    async fn ping(&self) -> BridgeResult<()>;

    /// False once the session is closed or known to be broken.
    fn is_alive(&self) -> bool;

    /// Release the underlying process or connection. Idempotent.
    async fn close(&self) -> BridgeResult<()>;
}

/// Opens sessions. Injectable so tests can count or fail connects.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, server: &ServerConfig) -> BridgeResult<Arc<dyn CapabilityTransport>>;
}

/// Connector selecting the transport by [`TransportConfig`] kind.
pub struct DefaultConnector {
    config: BridgeConfig,
    global_proxy: Option<ProxyConfig>,
}

impl DefaultConnector {
    pub fn new(config: BridgeConfig) -> Self {
        let global_proxy = config.proxy.clone();
        Self {
            config,
            global_proxy,
        }
    }
}

#[async_trait]
impl TransportConnector for DefaultConnector {
    async fn connect(&self, server: &ServerConfig) -> BridgeResult<Arc<dyn CapabilityTransport>> {
        match &server.transport {
            TransportConfig::Stdio { command, args, env } => {
                let transport = StdioTransport::connect(
                    server.id.clone(),
                    command,
                    args,
                    env,
                    &self.config.stdio,
                )
                .await?;
                Ok(Arc::new(transport))
            }
            TransportConfig::HttpSse { url, headers, .. } => {
                let proxy = crate::core::proxy::resolve_proxy_config(
                    &server.transport,
                    self.global_proxy.as_ref(),
                );
                let transport = HttpSseTransport::connect(
                    server.id.clone(),
                    url,
                    headers,
                    proxy,
                    &self.config.http,
                )
                .await?;
                Ok(Arc::new(transport))
            }
        }
    }
}
