//! Per-run bridge.
//!
//! A [`Bridge`] holds the open transport sessions of one execution
//! context. Sessions open lazily on the first invocation against a server
//! and live until the bridge is closed at the end of the run.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::{
    config::{ServerConfig, ServerId},
    metrics::BridgeMetrics,
};
use crate::{
    error::{BridgeError, BridgeResult},
    tenant::ExecutionContextId,
    transport::{CapabilityTransport, TransportConnector},
};

/// One server's session, guarded so concurrent first calls open it once.
type SessionSlot = Arc<tokio::sync::Mutex<Option<Arc<dyn CapabilityTransport>>>>;

pub struct Bridge {
    context_id: ExecutionContextId,
    servers: parking_lot::Mutex<BTreeSet<ServerId>>,
    sessions: parking_lot::Mutex<HashMap<ServerId, SessionSlot>>,
    created_at: DateTime<Utc>,
    closed: AtomicBool,
}

impl Bridge {
    pub fn new(context_id: ExecutionContextId, servers: impl IntoIterator<Item = ServerId>) -> Self {
        Self {
            context_id,
            servers: parking_lot::Mutex::new(servers.into_iter().collect()),
            sessions: parking_lot::Mutex::new(HashMap::new()),
            created_at: Utc::now(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn context_id(&self) -> &ExecutionContextId {
        &self.context_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Servers the run declared it may use.
    pub fn servers(&self) -> Vec<ServerId> {
        self.servers.lock().iter().cloned().collect()
    }

    pub(crate) fn declare(&self, servers: &[ServerId]) {
        self.servers.lock().extend(servers.iter().cloned());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of sessions currently open.
    pub fn open_session_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|slot| slot.try_lock().map(|s| s.is_some()).unwrap_or(true))
            .count()
    }

    pub fn has_session(&self, server_id: &ServerId) -> bool {
        self.sessions
            .lock()
            .get(server_id)
            .map(|slot| slot.try_lock().map(|s| s.is_some()).unwrap_or(true))
            .unwrap_or(false)
    }

    /// Return the open session for `server`, opening one if needed.
    ///
    /// A session that reports itself dead is closed and replaced.
    pub async fn session(
        &self,
        server: &ServerConfig,
        connector: &dyn TransportConnector,
        metrics: &BridgeMetrics,
    ) -> BridgeResult<Arc<dyn CapabilityTransport>> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let slot = {
            let mut sessions = self.sessions.lock();
            Arc::clone(sessions.entry(server.id.clone()).or_default())
        };
        let mut current = slot.lock().await;

        if let Some(transport) = current.as_ref() {
            if transport.is_alive() {
                return Ok(Arc::clone(transport));
            }
        }
        if let Some(stale) = current.take() {
            debug!(
                context_id = %self.context_id,
                server_id = %server.id,
                "Replacing dead session"
            );
            if let Err(e) = stale.close().await {
                debug!(server_id = %server.id, "Closing dead session failed: {}", e);
            }
        }

        let connected = connector.connect(server).await;
        metrics.record_connect(server.transport.kind().as_str(), connected.is_ok());
        let transport = connected?;

        if self.is_closed() {
            if let Err(e) = transport.close().await {
                debug!(server_id = %server.id, "Closing late session failed: {}", e);
            }
            return Err(self.closed_error());
        }

        debug!(
            context_id = %self.context_id,
            server_id = %server.id,
            transport = server.transport.kind().as_str(),
            "Opened session"
        );
        *current = Some(Arc::clone(&transport));
        Ok(transport)
    }

    /// Close the session for one server, if open. The bridge stays usable.
    pub async fn close_server(&self, server_id: &ServerId) -> bool {
        let slot = self.sessions.lock().remove(server_id);
        let Some(slot) = slot else {
            return false;
        };
        let transport = slot.lock().await.take();
        match transport {
            Some(transport) => {
                if let Err(e) = transport.close().await {
                    warn!(
                        context_id = %self.context_id,
                        server_id = %server_id,
                        "Failed to close session: {}",
                        e
                    );
                }
                true
            }
            None => false,
        }
    }

    /// Close every open session. Only the first call does any work;
    /// individual close failures are logged and do not stop the others.
    ///
    /// Returns the number of sessions that were open.
    pub async fn close(&self) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }

        let slots: Vec<(ServerId, SessionSlot)> = self.sessions.lock().drain().collect();
        let closes = slots.into_iter().map(|(server_id, slot)| async move {
            let transport = slot.lock().await.take()?;
            if let Err(e) = transport.close().await {
                warn!(
                    context_id = %self.context_id,
                    server_id = %server_id,
                    "Failed to close session: {}",
                    e
                );
            }
            Some(server_id)
        });
        let closed = join_all(closes).await.into_iter().flatten().count();

        info!(
            context_id = %self.context_id,
            sessions = closed,
            "Closed bridge"
        );
        closed
    }

    fn closed_error(&self) -> BridgeError {
        BridgeError::ContextEnded(self.context_id.to_string())
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("context_id", &self.context_id)
            .field("servers", &self.servers())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::{
        core::config::{ServerDefinition, TransportKind},
        inventory::CapabilitySet,
        transport::ChunkSink,
    };

    pub(crate) struct CountingTransport {
        server_id: ServerId,
        alive: AtomicBool,
        closes: Arc<AtomicUsize>,
        fail_close: bool,
    }

    #[async_trait]
    impl CapabilityTransport for CountingTransport {
        fn server_id(&self) -> &ServerId {
            &self.server_id
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Stdio
        }

        async fn list_capabilities(&self) -> BridgeResult<CapabilitySet> {
            Ok(CapabilitySet::new(self.server_id.clone()))
        }

        async fn invoke_tool(&self, _: &str, args: Value, _: &ChunkSink) -> BridgeResult<Value> {
            Ok(args)
        }

        async fn read_resource(&self, _: &str, _: &ChunkSink) -> BridgeResult<Value> {
            Ok(Value::Null)
        }

        async fn get_prompt(&self, _: &str, _: Value, _: &ChunkSink) -> BridgeResult<Value> {
            Ok(Value::Null)
        }

        async fn ping(&self) -> BridgeResult<()> {
            Ok(())
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn close(&self) -> BridgeResult<()> {
            self.alive.store(false, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(BridgeError::Connection("close failed".to_string()));
            }
            Ok(())
        }
    }

    /// Opens [`CountingTransport`]s and counts connects and closes.
    #[derive(Default)]
    pub(crate) struct CountingConnector {
        pub connects: AtomicUsize,
        pub closes: Arc<AtomicUsize>,
        pub fail_close_for: Option<&'static str>,
    }

    #[async_trait]
    impl TransportConnector for CountingConnector {
        async fn connect(
            &self,
            server: &ServerConfig,
        ) -> BridgeResult<Arc<dyn CapabilityTransport>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(Arc::new(CountingTransport {
                server_id: server.id.clone(),
                alive: AtomicBool::new(true),
                closes: Arc::clone(&self.closes),
                fail_close: self.fail_close_for == Some(server.id.as_str()),
            }))
        }
    }

    fn server(id: &str) -> ServerConfig {
        ServerConfig::from_definition(ServerDefinition::stdio(id, "acme", "unused", vec![]))
    }

    #[tokio::test]
    async fn test_session_opens_once_under_concurrency() {
        let bridge = Arc::new(Bridge::new(ExecutionContextId::new("run-1"), []));
        let connector = Arc::new(CountingConnector::default());
        let metrics = Arc::new(BridgeMetrics::new());
        let s1 = server("s1");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let bridge = Arc::clone(&bridge);
                let connector = Arc::clone(&connector);
                let metrics = Arc::clone(&metrics);
                let s1 = s1.clone();
                tokio::spawn(async move {
                    bridge
                        .session(&s1, connector.as_ref(), &metrics)
                        .await
                        .map(|_| ())
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.open_session_count(), 1);
    }

    #[tokio::test]
    async fn test_dead_session_replaced() {
        let bridge = Bridge::new(ExecutionContextId::new("run-1"), []);
        let connector = CountingConnector::default();
        let metrics = BridgeMetrics::new();
        let s1 = server("s1");

        let first = bridge.session(&s1, &connector, &metrics).await.unwrap();
        first.close().await.unwrap();
        let second = bridge.session(&s1, &connector, &metrics).await.unwrap();

        assert!(second.is_alive());
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_survives_close_errors() {
        let bridge = Bridge::new(ExecutionContextId::new("run-1"), []);
        let connector = CountingConnector {
            fail_close_for: Some("s1"),
            ..Default::default()
        };
        let metrics = BridgeMetrics::new();

        bridge.session(&server("s1"), &connector, &metrics).await.unwrap();
        bridge.session(&server("s2"), &connector, &metrics).await.unwrap();
        assert_eq!(bridge.open_session_count(), 2);

        assert_eq!(bridge.close().await, 2);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 2);
        assert_eq!(bridge.close().await, 0);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 2);

        let refused = bridge.session(&server("s1"), &connector, &metrics).await;
        assert!(matches!(refused, Err(BridgeError::ContextEnded(_))));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_server_keeps_bridge_open() {
        let bridge = Bridge::new(ExecutionContextId::new("run-1"), [ServerId::new("s1")]);
        let connector = CountingConnector::default();
        let metrics = BridgeMetrics::new();

        bridge.session(&server("s1"), &connector, &metrics).await.unwrap();
        assert!(bridge.has_session(&ServerId::new("s1")));
        assert!(bridge.close_server(&ServerId::new("s1")).await);
        assert!(!bridge.close_server(&ServerId::new("s1")).await);
        assert!(!bridge.is_closed());

        bridge.session(&server("s1"), &connector, &metrics).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }
}
