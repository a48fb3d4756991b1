//! Background health probing.
//!
//! Every interval each live server is probed with a fresh session:
//! connect, ping, close. Probes run concurrently and each is bounded by
//! the probe timeout. Results feed the [`HealthTracker`].

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::future::join_all;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::state::{HealthSnapshot, HealthTracker};
use crate::{
    core::{
        catalog::ServerCatalog,
        config::{HealthConfig, ServerConfig, ServerId},
    },
    error::{BridgeError, BridgeResult},
    transport::TransportConnector,
};

pub struct HealthMonitor {
    catalog: Arc<ServerCatalog>,
    tracker: Arc<HealthTracker>,
    connector: Arc<dyn TransportConnector>,
    interval: Duration,
    probe_timeout: Duration,
}

/// Running monitor loop. Dropping the handle leaves the loop running;
/// call [`HealthMonitorHandle::stop`] to end it.
pub struct HealthMonitorHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl HealthMonitorHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            debug!("Health monitor task ended abnormally: {}", e);
        }
    }
}

impl HealthMonitor {
    pub fn new(
        catalog: Arc<ServerCatalog>,
        tracker: Arc<HealthTracker>,
        connector: Arc<dyn TransportConnector>,
        config: &HealthConfig,
    ) -> Self {
        Self {
            catalog,
            tracker,
            connector,
            interval: config.probe_interval(),
            probe_timeout: config.probe_timeout(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the periodic loop. The first round runs one interval after
    /// start.
    pub fn spawn(self: Arc<Self>) -> HealthMonitorHandle {
        let token = CancellationToken::new();
        let child = token.clone();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = self.interval.as_secs_f64(), "Health monitor started");

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        self.probe_all().await;
                    }
                }
            }
            info!("Health monitor stopped");
        });
        HealthMonitorHandle { token, task }
    }

    /// Probe every live server once, concurrently.
    pub async fn probe_all(&self) -> Vec<HealthSnapshot> {
        let servers = self.catalog.list();
        if servers.is_empty() {
            return Vec::new();
        }
        debug!(servers = servers.len(), "Running health probes");

        let snapshots = join_all(servers.iter().map(|server| self.check(server))).await;

        let next = Utc::now()
            + chrono::Duration::from_std(self.interval).unwrap_or(chrono::Duration::zero());
        for server in &servers {
            self.tracker.set_next_probe(&server.id, next);
        }
        snapshots
    }

    /// Probe one server immediately, outside the periodic schedule.
    pub async fn check_now(&self, server_id: &ServerId) -> BridgeResult<HealthSnapshot> {
        let server = self
            .catalog
            .get(server_id)
            .ok_or_else(|| BridgeError::ServerNotFound(server_id.to_string()))?;
        Ok(self.check(&server).await)
    }

    async fn check(&self, server: &ServerConfig) -> HealthSnapshot {
        let outcome = tokio::time::timeout(self.probe_timeout, self.probe(server))
            .await
            .unwrap_or(Err(BridgeError::Timeout(self.probe_timeout)));
        self.tracker.record_probe(&server.id, outcome.as_ref().err())
    }

    async fn probe(&self, server: &ServerConfig) -> BridgeResult<()> {
        let transport = self.connector.connect(server).await?;
        let pinged = transport.ping().await;
        if let Err(e) = transport.close().await {
            debug!(server_id = %server.id, "Closing probe session failed: {}", e);
        }
        pinged
    }
}
