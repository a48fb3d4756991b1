//! Bridge pool keyed by execution context.
//!
//! Exactly one [`Bridge`] exists per live execution context. Cleanup swaps
//! the bridge for a tombstone before closing it, so concurrent cleanups of
//! the same context close its sessions once, and a call that races the end
//! of its run cannot open a fresh bridge nobody will clean up.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use tracing::{debug, warn};

use super::{bridge::Bridge, config::ServerId, metrics::BridgeMetrics};
use crate::{
    error::{BridgeError, BridgeResult},
    tenant::ExecutionContextId,
};

/// How long an ended context keeps refusing new sessions.
pub const DEFAULT_ENDED_RETENTION: Duration = Duration::from_secs(600);

enum Slot {
    Live(Arc<Bridge>),
    Ended(Instant),
}

pub struct BridgePool {
    slots: DashMap<ExecutionContextId, Slot>,
    metrics: Arc<BridgeMetrics>,
    ended_retention: Duration,
}

impl BridgePool {
    pub fn new(metrics: Arc<BridgeMetrics>) -> Self {
        Self::with_ended_retention(metrics, DEFAULT_ENDED_RETENTION)
    }

    pub fn with_ended_retention(metrics: Arc<BridgeMetrics>, ended_retention: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            metrics,
            ended_retention,
        }
    }

    /// Return the bridge for `context_id`, creating an empty one if needed.
    ///
    /// Fails with [`BridgeError::ContextEnded`] once the context's run has
    /// ended; only [`begin_run`](Self::begin_run) starts it again.
    pub fn get_or_create(
        &self,
        context_id: &ExecutionContextId,
        required_servers: &[ServerId],
    ) -> BridgeResult<Arc<Bridge>> {
        let (bridge, created) = match self.slots.entry(context_id.clone()) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Live(bridge) => (Arc::clone(bridge), false),
                Slot::Ended(_) => {
                    return Err(BridgeError::ContextEnded(context_id.to_string()));
                }
            },
            Entry::Vacant(entry) => {
                debug!(context_id = %context_id, "Creating bridge");
                let bridge = Arc::new(Bridge::new(context_id.clone(), required_servers.iter().cloned()));
                entry.insert(Slot::Live(Arc::clone(&bridge)));
                (bridge, true)
            }
        };
        if created {
            self.metrics.set_active_bridges(self.len());
        }
        bridge.declare(required_servers);
        Ok(bridge)
    }

    pub fn get(&self, context_id: &ExecutionContextId) -> Option<Arc<Bridge>> {
        self.slots.get(context_id).and_then(|slot| match slot.value() {
            Slot::Live(bridge) => Some(Arc::clone(bridge)),
            Slot::Ended(_) => None,
        })
    }

    /// Close and remove the bridge for `context_id`, and refuse new sessions
    /// for it from now on.
    ///
    /// Returns false when there was nothing to clean up.
    pub async fn cleanup(&self, context_id: &ExecutionContextId) -> bool {
        self.prune_ended();
        let previous = self
            .slots
            .insert(context_id.clone(), Slot::Ended(Instant::now()));
        let Some(Slot::Live(bridge)) = previous else {
            return false;
        };
        self.metrics.set_active_bridges(self.len());
        bridge.close().await;
        true
    }

    /// Drop tombstones older than the retention window.
    fn prune_ended(&self) {
        let retention = self.ended_retention;
        self.slots.retain(|_, slot| match slot {
            Slot::Ended(at) => at.elapsed() < retention,
            Slot::Live(_) => true,
        });
    }

    fn live_bridges(&self) -> Vec<Arc<Bridge>> {
        self.slots
            .iter()
            .filter_map(|slot| match slot.value() {
                Slot::Live(bridge) => Some(Arc::clone(bridge)),
                Slot::Ended(_) => None,
            })
            .collect()
    }

    /// Close the sessions every bridge holds with one server.
    pub async fn close_server_sessions(&self, server_id: &ServerId) -> usize {
        let bridges = self.live_bridges();
        let closed = join_all(bridges.iter().map(|b| b.close_server(server_id))).await;
        closed.into_iter().filter(|c| *c).count()
    }

    /// Clean up every bridge.
    pub async fn shutdown(&self) -> usize {
        let contexts = self.context_ids();
        let count = contexts.len();
        join_all(contexts.iter().map(|ctx| self.cleanup(ctx))).await;
        count
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Live(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, context_id: &ExecutionContextId) -> bool {
        self.get(context_id).is_some()
    }

    /// Whether `context_id` ended recently enough to still be refused.
    pub fn has_ended(&self, context_id: &ExecutionContextId) -> bool {
        self.slots
            .get(context_id)
            .is_some_and(|slot| matches!(slot.value(), Slot::Ended(_)))
    }

    pub fn context_ids(&self) -> Vec<ExecutionContextId> {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Live(_)))
            .map(|slot| slot.key().clone())
            .collect()
    }

    /// Start a run whose bridge is cleaned up when the returned scope ends.
    ///
    /// Reusing the id of an ended run starts it afresh.
    pub fn begin_run(
        self: &Arc<Self>,
        context_id: ExecutionContextId,
        required_servers: &[ServerId],
    ) -> RunScope {
        self.slots
            .remove_if(&context_id, |_, slot| matches!(slot, Slot::Ended(_)));
        if let Err(e) = self.get_or_create(&context_id, required_servers) {
            warn!(context_id = %context_id, "Run started while its context was ending: {}", e);
        }
        RunScope {
            pool: Arc::clone(self),
            context_id,
            finished: false,
        }
    }
}

/// Guard tying a bridge's lifetime to a run.
///
/// Prefer [`RunScope::finish`]; if the scope is dropped instead (early
/// return, panic, cancelled task) cleanup is spawned on the current runtime.
pub struct RunScope {
    pool: Arc<BridgePool>,
    context_id: ExecutionContextId,
    finished: bool,
}

impl RunScope {
    pub fn context_id(&self) -> &ExecutionContextId {
        &self.context_id
    }

    pub async fn finish(mut self) -> bool {
        self.finished = true;
        self.pool.cleanup(&self.context_id).await
    }
}

impl Drop for RunScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let pool = Arc::clone(&self.pool);
        let context_id = self.context_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.cleanup(&context_id).await;
                });
            }
            Err(_) => {
                warn!(
                    context_id = %context_id,
                    "No runtime available, bridge left for shutdown"
                );
            }
        }
    }
}
