//! Service facade.
//!
//! [`ToolBridge`] wires the catalog, health tracker, registry, bridge pool
//! and dispatcher together and exposes the registration API, invocation
//! entry points and run lifecycle.

use std::{future::Future, sync::Arc, time::Duration};

use serde_json::Value;
use tracing::{info, warn};

use super::{
    catalog::ServerCatalog,
    config::{BridgeConfig, ServerConfig, ServerDefinition, ServerEdit, ServerId},
    dispatcher::{Dispatcher, InvocationResult},
    metrics::BridgeMetrics,
    pool::{BridgePool, RunScope},
};
use crate::{
    error::{BridgeError, BridgeResult},
    health::{HealthMonitor, HealthMonitorHandle, HealthSnapshot, HealthTracker},
    inventory::{CapabilityRegistry, CapabilitySet, ToolAssignment},
    tenant::{BudgetProvider, ExecutionContextId},
    transport::{DefaultConnector, TransportConnector},
};

pub struct ToolBridge {
    config: BridgeConfig,
    catalog: Arc<ServerCatalog>,
    health: Arc<HealthTracker>,
    registry: Arc<CapabilityRegistry>,
    pool: Arc<BridgePool>,
    dispatcher: Dispatcher,
    monitor: Arc<HealthMonitor>,
    monitor_handle: tokio::sync::Mutex<Option<HealthMonitorHandle>>,
    metrics: Arc<BridgeMetrics>,
}

impl ToolBridge {
    /// Create a bridge service using the built-in stdio and HTTP+SSE transports.
    pub fn new(config: BridgeConfig, budget: Arc<dyn BudgetProvider>) -> BridgeResult<Self> {
        let connector = Arc::new(DefaultConnector::new(config.clone()));
        Self::with_connector(config, connector, budget)
    }

    pub fn with_connector(
        config: BridgeConfig,
        connector: Arc<dyn TransportConnector>,
        budget: Arc<dyn BudgetProvider>,
    ) -> BridgeResult<Self> {
        config.validate()?;

        let metrics = Arc::new(BridgeMetrics::new());
        let catalog = Arc::new(ServerCatalog::new());
        let health = Arc::new(HealthTracker::new(
            Arc::clone(&catalog),
            config.health.failure_threshold,
        ));
        let registry = Arc::new(CapabilityRegistry::new(
            Arc::clone(&connector),
            Arc::clone(&health),
            Arc::clone(&metrics),
            config.invocation.default_timeout(),
        ));
        let pool = Arc::new(BridgePool::with_ended_retention(
            Arc::clone(&metrics),
            config.invocation.run_timeout(),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&catalog),
            Arc::clone(&health),
            Arc::clone(&pool),
            Arc::clone(&connector),
            budget,
            Arc::clone(&metrics),
            config.invocation.default_timeout(),
        );
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&catalog),
            Arc::clone(&health),
            connector,
            &config.health,
        ));

        Ok(Self {
            config,
            catalog,
            health,
            registry,
            pool,
            dispatcher,
            monitor,
            monitor_handle: tokio::sync::Mutex::new(None),
            metrics,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<ServerCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<BridgePool> {
        &self.pool
    }

    pub fn health_tracker(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn metrics(&self) -> &Arc<BridgeMetrics> {
        &self.metrics
    }

    // ========================================================================
    // Registration API
    // ========================================================================

    /// Register a server and run its first discovery.
    ///
    /// A failed discovery does not undo the registration; it is recorded as
    /// a health failure and can be retried with [`ToolBridge::rediscover`].
    pub async fn register_server(&self, definition: ServerDefinition) -> BridgeResult<ServerConfig> {
        let server = self.catalog.register(definition)?;
        if let Err(e) = self.discover(&server).await {
            warn!(server_id = %server.id, "Initial discovery failed: {}", e);
        }
        Ok(self.catalog.get(&server.id).unwrap_or(server))
    }

    /// Edit a server. Changing the transport closes its open sessions; the
    /// capability set is kept until the next rediscovery.
    pub async fn update_server(&self, id: &ServerId, edit: ServerEdit) -> BridgeResult<ServerConfig> {
        let transport_changed = edit.transport.is_some();
        let server = self.catalog.update(id, edit)?;
        if transport_changed {
            let closed = self.pool.close_server_sessions(id).await;
            info!(server_id = %id, sessions = closed, "Transport changed, closed sessions");
        }
        Ok(server)
    }

    /// Remove a server, its capabilities, health state and open sessions.
    pub async fn remove_server(&self, id: &ServerId) -> BridgeResult<ServerConfig> {
        let server = self.catalog.remove(id)?;
        self.registry.remove_server(id);
        self.health.forget(id);
        self.pool.close_server_sessions(id).await;
        Ok(server)
    }

    pub async fn rediscover(&self, id: &ServerId) -> BridgeResult<Arc<CapabilitySet>> {
        let server = self
            .catalog
            .get(id)
            .ok_or_else(|| BridgeError::ServerNotFound(id.to_string()))?;
        self.discover(&server).await
    }

    async fn discover(&self, server: &ServerConfig) -> BridgeResult<Arc<CapabilitySet>> {
        let set = self.registry.rediscover(server).await?;
        // Removed while discovery was in flight.
        if !self.catalog.contains(&server.id) {
            self.registry.remove_server(&server.id);
            return Err(BridgeError::ServerNotFound(server.id.to_string()));
        }
        Ok(set)
    }

    /// Probe one server now.
    pub async fn check_health(&self, id: &ServerId) -> BridgeResult<HealthSnapshot> {
        self.monitor.check_now(id).await
    }

    pub fn health(&self, id: &ServerId) -> Option<HealthSnapshot> {
        self.health.snapshot(id)
    }

    pub fn get_server(&self, id: &ServerId) -> Option<ServerConfig> {
        self.catalog.get(id)
    }

    pub fn list_servers(&self) -> Vec<ServerConfig> {
        self.catalog.list()
    }

    /// Capabilities last discovered for a server. Empty when discovery
    /// has not yet succeeded.
    pub fn list_capabilities(&self, id: &ServerId) -> BridgeResult<Arc<CapabilitySet>> {
        if !self.catalog.contains(id) {
            return Err(BridgeError::ServerNotFound(id.to_string()));
        }
        Ok(self
            .registry
            .get(id)
            .unwrap_or_else(|| Arc::new(CapabilitySet::new(id.clone()))))
    }

    // ========================================================================
    // Invocation
    // ========================================================================

    pub async fn invoke(
        &self,
        context_id: &ExecutionContextId,
        capability: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> InvocationResult {
        self.dispatcher
            .invoke(context_id, capability, arguments, timeout)
            .await
    }

    pub async fn invoke_assigned(
        &self,
        context_id: &ExecutionContextId,
        assignment: &ToolAssignment,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> InvocationResult {
        self.dispatcher
            .invoke_assigned(context_id, assignment, arguments, timeout)
            .await
    }

    // ========================================================================
    // Run lifecycle
    // ========================================================================

    /// Close every session of a finished run. Safe to call more than once.
    pub async fn run_ended(&self, context_id: &ExecutionContextId) -> bool {
        self.pool.cleanup(context_id).await
    }

    pub fn begin_run(&self, context_id: ExecutionContextId, required_servers: &[ServerId]) -> RunScope {
        self.pool.begin_run(context_id, required_servers)
    }

    /// Run `run` under the configured run timeout, then clean up its bridge.
    pub async fn scoped_run<F, T>(&self, context_id: ExecutionContextId, run: F) -> BridgeResult<T>
    where
        F: Future<Output = T>,
    {
        self.scoped_run_with_timeout(context_id, self.config.invocation.run_timeout(), run)
            .await
    }

    pub async fn scoped_run_with_timeout<F, T>(
        &self,
        context_id: ExecutionContextId,
        timeout: Duration,
        run: F,
    ) -> BridgeResult<T>
    where
        F: Future<Output = T>,
    {
        let scope = self.begin_run(context_id, &[]);
        let outcome = tokio::time::timeout(timeout, run).await;
        if outcome.is_err() {
            warn!(context_id = %scope.context_id(), "Run exceeded {:?}", timeout);
        }
        scope.finish().await;
        outcome.map_err(|_| BridgeError::Timeout(timeout))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start periodic health probing. Returns false if already running.
    pub async fn start_health_monitor(&self) -> bool {
        let mut handle = self.monitor_handle.lock().await;
        if handle.as_ref().is_some_and(|h| h.is_running()) {
            return false;
        }
        *handle = Some(Arc::clone(&self.monitor).spawn());
        true
    }

    pub async fn stop_health_monitor(&self) {
        if let Some(handle) = self.monitor_handle.lock().await.take() {
            handle.stop().await;
        }
    }

    /// Stop probing and close every open bridge.
    pub async fn shutdown(&self) {
        self.stop_health_monitor().await;
        let bridges = self.pool.shutdown().await;
        info!(bridges, "Tool bridge shut down");
    }
}
