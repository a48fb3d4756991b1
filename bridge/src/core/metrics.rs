//! Bridge metrics.
//!
//! Keeps an in-process snapshot (totals plus per-capability latency) and
//! mirrors every event to the `metrics` facade so an installed exporter
//! can publish it.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use dashmap::DashMap;
use metrics::{counter, gauge, histogram};

use super::config::ServerId;
use crate::inventory::QualifiedCapability;

pub const INVOCATIONS_TOTAL: &str = "toolbridge_invocations_total";
pub const INVOCATION_FAILURES_TOTAL: &str = "toolbridge_invocation_failures_total";
pub const CIRCUIT_OPEN_REJECTIONS_TOTAL: &str = "toolbridge_circuit_open_rejections_total";
pub const INVOCATION_DURATION_SECONDS: &str = "toolbridge_invocation_duration_seconds";
pub const CIRCUIT_STATE: &str = "toolbridge_circuit_state";
pub const CIRCUIT_TRANSITIONS_TOTAL: &str = "toolbridge_circuit_transitions_total";
pub const ACTIVE_BRIDGES: &str = "toolbridge_active_bridges";
pub const TRANSPORT_CONNECTS_TOTAL: &str = "toolbridge_transport_connects_total";
pub const DISCOVERIES_TOTAL: &str = "toolbridge_discoveries_total";

/// Metrics for bridge operations.
pub struct BridgeMetrics {
    // Invocation metrics
    total_invocations: AtomicU64,
    successful_invocations: AtomicU64,
    failed_invocations: AtomicU64,
    circuit_open_rejections: AtomicU64,
    budget_rejections: AtomicU64,
    timeouts: AtomicU64,
    active_invocations: AtomicU64,

    // Connection metrics
    connects: AtomicU64,
    connect_failures: AtomicU64,

    // Per-capability latency tracking
    latencies: DashMap<QualifiedCapability, LatencyStats>,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self {
            total_invocations: AtomicU64::new(0),
            successful_invocations: AtomicU64::new(0),
            failed_invocations: AtomicU64::new(0),
            circuit_open_rejections: AtomicU64::new(0),
            budget_rejections: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            active_invocations: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            latencies: DashMap::new(),
        }
    }

    pub fn record_invocation_start(&self) {
        self.total_invocations.fetch_add(1, Ordering::Relaxed);
        self.active_invocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the end of an invocation. `outcome` is `"success"` or a failure kind.
    pub fn record_invocation_end(
        &self,
        capability: &QualifiedCapability,
        outcome: &'static str,
        duration: Duration,
    ) {
        self.active_invocations.fetch_sub(1, Ordering::Relaxed);

        let server = capability.server_id.to_string();
        if outcome == "success" {
            self.successful_invocations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_invocations.fetch_add(1, Ordering::Relaxed);
            counter!(INVOCATION_FAILURES_TOTAL,
                "server" => server.clone(),
                "kind" => outcome
            )
            .increment(1);
        }

        counter!(INVOCATIONS_TOTAL,
            "server" => server.clone(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!(INVOCATION_DURATION_SECONDS, "server" => server).record(duration.as_secs_f64());

        self.latencies
            .entry(capability.clone())
            .or_insert_with(LatencyStats::new)
            .record(duration.as_millis() as u64);
    }

    pub fn record_circuit_rejection(&self, server_id: &ServerId) {
        self.circuit_open_rejections.fetch_add(1, Ordering::Relaxed);
        counter!(CIRCUIT_OPEN_REJECTIONS_TOTAL, "server" => server_id.to_string()).increment(1);
    }

    pub fn record_budget_rejection(&self) {
        self.budget_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect(&self, transport: &'static str, success: bool) {
        if success {
            self.connects.fetch_add(1, Ordering::Relaxed);
        } else {
            self.connect_failures.fetch_add(1, Ordering::Relaxed);
        }
        counter!(TRANSPORT_CONNECTS_TOTAL,
            "transport" => transport,
            "outcome" => if success { "success" } else { "failure" }
        )
        .increment(1);
    }

    pub fn set_active_bridges(&self, count: usize) {
        gauge!(ACTIVE_BRIDGES).set(count as f64);
    }

    pub fn record_discovery(&self, server_id: &ServerId, success: bool) {
        counter!(DISCOVERIES_TOTAL,
            "server" => server_id.to_string(),
            "outcome" => if success { "success" } else { "failure" }
        )
        .increment(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_invocations: self.total_invocations.load(Ordering::Relaxed),
            successful_invocations: self.successful_invocations.load(Ordering::Relaxed),
            failed_invocations: self.failed_invocations.load(Ordering::Relaxed),
            circuit_open_rejections: self.circuit_open_rejections.load(Ordering::Relaxed),
            budget_rejections: self.budget_rejections.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            active_invocations: self.active_invocations.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
        }
    }

    pub fn capability_latency(&self, capability: &QualifiedCapability) -> Option<LatencySnapshot> {
        self.latencies.get(capability).map(|stats| stats.snapshot())
    }

    pub fn all_latencies(&self) -> Vec<(QualifiedCapability, LatencySnapshot)> {
        self.latencies
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Circuit breaker gauges, shared by the dispatcher and the health monitor.
pub(crate) fn record_circuit_transition(server_id: &ServerId, from: &'static str, to: &'static str) {
    counter!(CIRCUIT_TRANSITIONS_TOTAL,
        "server" => server_id.to_string(),
        "from" => from,
        "to" => to
    )
    .increment(1);
}

pub(crate) fn set_circuit_state(server_id: &ServerId, state: u8) {
    gauge!(CIRCUIT_STATE, "server" => server_id.to_string()).set(f64::from(state));
}

/// Per-capability latency statistics.
pub struct LatencyStats {
    count: AtomicU64,
    total_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyStats {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            max_ms: AtomicU64::new(0),
        }
    }

    fn record(&self, ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_ms.load(Ordering::Relaxed);
        let min = self.min_ms.load(Ordering::Relaxed);

        LatencySnapshot {
            count,
            avg_ms: if count > 0 { total / count } else { 0 },
            min_ms: if min == u64::MAX { 0 } else { min },
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_invocations: u64,
    pub successful_invocations: u64,
    pub failed_invocations: u64,
    pub circuit_open_rejections: u64,
    pub budget_rejections: u64,
    pub timeouts: u64,
    pub active_invocations: u64,
    pub connects: u64,
    pub connect_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySnapshot {
    pub count: u64,
    pub avg_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}
