//! Capability registry.
//!
//! Holds the capability set of every server behind one atomically swapped
//! snapshot. Readers load the current snapshot without locking; a
//! rediscovery builds a new snapshot and swaps it in, so a reader never
//! observes a partially replaced server.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::types::{Capability, CapabilityKind, CapabilitySet, QualifiedCapability, ToolAssignment};
use crate::{
    core::{
        config::{ServerConfig, ServerId},
        metrics::BridgeMetrics,
    },
    error::{BridgeError, BridgeResult},
    health::HealthTracker,
    transport::TransportConnector,
};

/// Name lookup precedence across primitive kinds.
const RESOLUTION_ORDER: [CapabilityKind; 3] = [
    CapabilityKind::Tool,
    CapabilityKind::Prompt,
    CapabilityKind::Resource,
];

#[derive(Default)]
struct RegistrySnapshot {
    /// Ordered by server id so collisions resolve deterministically.
    by_server: BTreeMap<ServerId, Arc<CapabilitySet>>,
}

pub struct CapabilityRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
    connector: Arc<dyn TransportConnector>,
    health: Arc<HealthTracker>,
    metrics: Arc<BridgeMetrics>,
    discovery_timeout: Duration,
}

impl CapabilityRegistry {
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        health: Arc<HealthTracker>,
        metrics: Arc<BridgeMetrics>,
        discovery_timeout: Duration,
    ) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
            connector,
            health,
            metrics,
            discovery_timeout,
        }
    }

    /// Connect to `server`, list its capabilities and replace its set.
    ///
    /// On failure the previous set stays in place and a health failure is
    /// recorded.
    pub async fn rediscover(&self, server: &ServerConfig) -> BridgeResult<Arc<CapabilitySet>> {
        let listed = tokio::time::timeout(self.discovery_timeout, async {
            let transport = self.connector.connect(server).await?;
            let listed = transport.list_capabilities().await;
            if let Err(e) = transport.close().await {
                debug!(server_id = %server.id, "Closing discovery session failed: {}", e);
            }
            listed
        })
        .await
        .unwrap_or(Err(BridgeError::Timeout(self.discovery_timeout)));

        match listed {
            Ok(mut set) => {
                set.server_id = server.id.clone();
                set.discovered_at = Utc::now();
                info!(
                    server_id = %server.id,
                    tools = set.tools.len(),
                    resources = set.resources.len(),
                    prompts = set.prompts.len(),
                    "Discovered {} capabilities from '{}'",
                    set.len(),
                    server.name
                );
                let set = Arc::new(set);
                self.store(Arc::clone(&set));
                self.health.record_success(&server.id);
                self.metrics.record_discovery(&server.id, true);
                Ok(set)
            }
            Err(e) => {
                warn!(
                    server_id = %server.id,
                    "Discovery failed, keeping previous capabilities: {}",
                    e
                );
                self.health.record_failure(&server.id, &e);
                self.metrics.record_discovery(&server.id, false);
                Err(e)
            }
        }
    }

    /// Atomically replace one server's capability set.
    pub fn store(&self, set: Arc<CapabilitySet>) {
        self.snapshot.rcu(|current| {
            let mut by_server = current.by_server.clone();
            by_server.insert(set.server_id.clone(), Arc::clone(&set));
            RegistrySnapshot { by_server }
        });
    }

    pub fn remove_server(&self, server_id: &ServerId) {
        self.snapshot.rcu(|current| {
            let mut by_server = current.by_server.clone();
            by_server.remove(server_id);
            RegistrySnapshot { by_server }
        });
    }

    pub fn get(&self, server_id: &ServerId) -> Option<Arc<CapabilitySet>> {
        self.snapshot.load().by_server.get(server_id).cloned()
    }

    pub fn server_ids(&self) -> Vec<ServerId> {
        self.snapshot.load().by_server.keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<Capability> {
        self.snapshot
            .load()
            .by_server
            .values()
            .flat_map(|set| set.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().by_server.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a capability by name: tools, then prompts, then resources
    /// (by name or URI). On a collision the lowest server id wins.
    pub fn resolve(&self, name: &str) -> Option<Capability> {
        let snapshot = self.snapshot.load();
        for kind in RESOLUTION_ORDER {
            let mut matches = snapshot
                .by_server
                .values()
                .filter_map(|set| set.find(kind, name));
            let Some(first) = matches.next() else {
                continue;
            };
            let others: Vec<&ServerId> = matches.map(|c| &c.server_id).collect();
            if !others.is_empty() {
                warn!(
                    "Capability '{}' exists on multiple servers; using '{}' (also on {:?})",
                    name, first.server_id, others
                );
            }
            return Some(first.clone());
        }
        None
    }

    pub fn resolve_qualified(&self, qualified: &QualifiedCapability) -> Option<Capability> {
        let set = self.get(&qualified.server_id)?;
        RESOLUTION_ORDER
            .iter()
            .find_map(|kind| set.find(*kind, &qualified.name))
            .cloned()
    }

    pub fn resolve_assignment(&self, assignment: &ToolAssignment) -> Option<Capability> {
        self.get(&assignment.server_id)?
            .find(assignment.kind, &assignment.capability_name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::{
        core::{
            catalog::ServerCatalog,
            config::{ServerDefinition, ServerStatus, TransportKind},
        },
        transport::{CapabilityTransport, ChunkSink},
    };

    struct FakeTransport {
        server_id: ServerId,
        tools: Vec<&'static str>,
    }

    #[async_trait]
    impl CapabilityTransport for FakeTransport {
        fn server_id(&self) -> &ServerId {
            &self.server_id
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Stdio
        }

        async fn list_capabilities(&self) -> BridgeResult<CapabilitySet> {
            let mut set = CapabilitySet::new(self.server_id.clone());
            for tool in &self.tools {
                set.tools
                    .push(Capability::new(self.server_id.clone(), CapabilityKind::Tool, *tool));
            }
            Ok(set)
        }

        async fn invoke_tool(&self, _: &str, _: Value, _: &ChunkSink) -> BridgeResult<Value> {
            Ok(Value::Null)
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
            true
        }

        async fn close(&self) -> BridgeResult<()> {
            Ok(())
        }
    }

    /// Serves a fixed tool list until told to fail.
    struct FakeConnector {
        tools: Vec<&'static str>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl TransportConnector for FakeConnector {
        async fn connect(
            &self,
            server: &ServerConfig,
        ) -> BridgeResult<Arc<dyn CapabilityTransport>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(BridgeError::Connection("refused".to_string()));
            }
            Ok(Arc::new(FakeTransport {
                server_id: server.id.clone(),
                tools: self.tools.clone(),
            }))
        }
    }

    fn setup(tools: Vec<&'static str>) -> (CapabilityRegistry, Arc<FakeConnector>, Arc<ServerCatalog>) {
        let catalog = Arc::new(ServerCatalog::new());
        let health = Arc::new(HealthTracker::new(Arc::clone(&catalog), 3));
        let connector = Arc::new(FakeConnector {
            tools,
            fail: AtomicBool::new(false),
        });
        let registry = CapabilityRegistry::new(
            Arc::clone(&connector) as Arc<dyn TransportConnector>,
            health,
            Arc::new(BridgeMetrics::new()),
            Duration::from_secs(5),
        );
        (registry, connector, catalog)
    }

    fn set_with(server: &str, kind: CapabilityKind, names: &[&str]) -> Arc<CapabilitySet> {
        let mut set = CapabilitySet::new(ServerId::new(server));
        for name in names {
            let cap = Capability::new(server, kind, *name);
            match kind {
                CapabilityKind::Tool => set.tools.push(cap),
                CapabilityKind::Prompt => set.prompts.push(cap),
                CapabilityKind::Resource => set.resources.push(cap.with_uri(format!("memo://{}", name))),
            }
        }
        Arc::new(set)
    }

    #[tokio::test]
    async fn test_failed_rediscovery_keeps_previous_set() {
        let (registry, connector, catalog) = setup(vec!["echo", "add"]);
        let server = catalog
            .register(ServerDefinition::stdio("s1", "acme", "unused", vec![]))
            .unwrap();

        let set = registry.rediscover(&server).await.unwrap();
        assert_eq!(set.tool_names(), vec!["echo", "add"]);

        connector.fail.store(true, Ordering::SeqCst);
        let result = registry.rediscover(&server).await;
        assert!(matches!(result, Err(BridgeError::Connection(_))));

        let current = registry.get(&server.id).unwrap();
        assert_eq!(current.tool_names(), vec!["echo", "add"]);
        assert_eq!(catalog.get(&server.id).unwrap().status, ServerStatus::Error);
    }

    #[test]
    fn test_resolution_precedence_and_collisions() {
        let (registry, _, _) = setup(vec![]);
        registry.store(set_with("b-server", CapabilityKind::Tool, &["search"]));
        registry.store(set_with("a-server", CapabilityKind::Tool, &["search"]));
        registry.store(set_with("c-server", CapabilityKind::Prompt, &["summarize", "search"]));
        registry.store(set_with("d-server", CapabilityKind::Resource, &["notes"]));

        let hit = registry.resolve("search").unwrap();
        assert_eq!(hit.server_id.as_str(), "a-server");
        assert_eq!(hit.kind, CapabilityKind::Tool);

        let prompt = registry.resolve("summarize").unwrap();
        assert_eq!(prompt.kind, CapabilityKind::Prompt);

        let by_uri = registry.resolve("memo://notes").unwrap();
        assert_eq!(by_uri.server_id.as_str(), "d-server");

        assert!(registry.resolve("missing").is_none());
    }

    #[test]
    fn test_precise_resolution() {
        let (registry, _, _) = setup(vec![]);
        registry.store(set_with("a-server", CapabilityKind::Tool, &["search"]));
        registry.store(set_with("b-server", CapabilityKind::Tool, &["search"]));

        let assignment = ToolAssignment::new("agent", "b-server", CapabilityKind::Tool, "search");
        let hit = registry.resolve_assignment(&assignment).unwrap();
        assert_eq!(hit.server_id.as_str(), "b-server");

        let wrong_kind = ToolAssignment::new("agent", "b-server", CapabilityKind::Prompt, "search");
        assert!(registry.resolve_assignment(&wrong_kind).is_none());

        let qualified = QualifiedCapability::new("b-server", "search");
        assert_eq!(
            registry.resolve_qualified(&qualified).unwrap().server_id.as_str(),
            "b-server"
        );
    }

    #[test]
    fn test_store_replaces_whole_set() {
        let (registry, _, _) = setup(vec![]);
        registry.store(set_with("s1", CapabilityKind::Tool, &["a", "b"]));
        registry.store(set_with("s1", CapabilityKind::Tool, &["c"]));
        assert_eq!(registry.get(&ServerId::new("s1")).unwrap().tool_names(), vec!["c"]);
        assert_eq!(registry.len(), 1);

        registry.remove_server(&ServerId::new("s1"));
        assert!(registry.is_empty());
        assert!(registry.resolve("c").is_none());
    }

    #[tokio::test]
    async fn test_readers_see_consistent_snapshot_during_writes() {
        let (registry, _, _) = setup(vec![]);
        let registry = Arc::new(registry);
        registry.store(set_with("s1", CapabilityKind::Tool, &["a", "b"]));

        let writer = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for i in 0..200 {
                    let names: &[&str] = if i % 2 == 0 { &["c", "d"] } else { &["a", "b"] };
                    registry.store(set_with("s1", CapabilityKind::Tool, names));
                    tokio::task::yield_now().await;
                }
            })
        };

        for _ in 0..200 {
            let set = registry.get(&ServerId::new("s1")).unwrap();
            let names = set.tool_names();
            assert!(names == vec!["a", "b"] || names == vec!["c", "d"]);
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
    }
}
