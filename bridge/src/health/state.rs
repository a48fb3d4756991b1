//! Per-server health state and circuit breaker.
//!
//! All fields are atomics so the dispatcher and the health monitor read
//! and write without a shared lock. The failure count and the circuit flag
//! share one word, so a reader never sees an open circuit with a reset
//! count or the reverse.

use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    core::{
        catalog::ServerCatalog,
        config::{ServerId, ServerStatus},
        metrics,
    },
    error::BridgeError,
};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;

/// Circuit flag above the 32-bit failure count.
const OPEN_BIT: u64 = 1 << 32;
const COUNT_MASK: u64 = u32::MAX as u64;

fn pack(failures: u32, circuit: CircuitState) -> u64 {
    let flag = match circuit {
        CircuitState::Open => OPEN_BIT,
        CircuitState::Closed => 0,
    };
    flag | u64::from(failures)
}

fn unpack(word: u64) -> (u32, CircuitState) {
    let failures = (word & COUNT_MASK) as u32;
    let circuit = if word & OPEN_BIT != 0 {
        CircuitState::Open
    } else {
        CircuitState::Closed
    };
    (failures, circuit)
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Invocations allowed
    Closed,
    /// Invocations rejected until a probe succeeds
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
        }
    }

    pub fn to_int(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
        }
    }

    pub fn from_int(value: u8) -> Self {
        match value {
            STATE_OPEN => CircuitState::Open,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one server's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub server_id: ServerId,
    pub consecutive_failures: u32,
    pub circuit: CircuitState,
    pub status: ServerStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub next_probe_at: Option<DateTime<Utc>>,
    pub total_successes: u64,
    pub total_failures: u64,
}

pub struct HealthState {
    server_id: ServerId,
    failure_threshold: u32,
    /// Consecutive failures and circuit state, see [`pack`]
    breaker: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    /// Unix millis, 0 = never
    last_checked_ms: AtomicI64,
    next_probe_ms: AtomicI64,
}

impl HealthState {
    pub fn new(server_id: ServerId, failure_threshold: u32) -> Self {
        Self {
            server_id,
            failure_threshold: failure_threshold.max(1),
            breaker: AtomicU64::new(pack(0, CircuitState::Closed)),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            last_checked_ms: AtomicI64::new(0),
            next_probe_ms: AtomicI64::new(0),
        }
    }

    pub fn circuit(&self) -> CircuitState {
        unpack(self.breaker.load(Ordering::Acquire)).1
    }

    pub fn is_open(&self) -> bool {
        self.circuit() == CircuitState::Open
    }

    pub fn consecutive_failures(&self) -> u32 {
        unpack(self.breaker.load(Ordering::Acquire)).0
    }

    /// Reset the failure count and close the circuit.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let (_, previous) = unpack(
            self.breaker
                .swap(pack(0, CircuitState::Closed), Ordering::AcqRel),
        );
        self.announce(previous, CircuitState::Closed, 0);
    }

    /// Count a failure; the threshold-th consecutive failure opens the circuit.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let threshold = self.failure_threshold;
        let after = |word: u64| {
            let (failures, circuit) = unpack(word);
            let failures = failures.saturating_add(1);
            let circuit = if failures >= threshold {
                CircuitState::Open
            } else {
                circuit
            };
            pack(failures, circuit)
        };
        let (Ok(word) | Err(word)) =
            self.breaker
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| Some(after(word)));
        let (_, previous) = unpack(word);
        let (failures, current) = unpack(after(word));
        self.announce(previous, current, failures);
    }

    pub fn mark_checked(&self) {
        self.last_checked_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    pub fn set_next_probe(&self, at: DateTime<Utc>) {
        self.next_probe_ms
            .store(at.timestamp_millis(), Ordering::Release);
    }

    /// Log and export a circuit transition, if there was one.
    fn announce(&self, old_state: CircuitState, new_state: CircuitState, failures: u32) {
        if old_state == new_state {
            return;
        }

        let from = old_state.as_str();
        let to = new_state.as_str();
        match new_state {
            CircuitState::Open => warn!(
                server_id = %self.server_id,
                failures,
                "Circuit breaker state transition: {} -> {}",
                from,
                to
            ),
            CircuitState::Closed => info!(
                server_id = %self.server_id,
                "Circuit breaker state transition: {} -> {}",
                from,
                to
            ),
        }
        metrics::record_circuit_transition(&self.server_id, from, to);
        metrics::set_circuit_state(&self.server_id, new_state.to_int());
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let (failures, circuit) = unpack(self.breaker.load(Ordering::Acquire));
        let status = if circuit == CircuitState::Open {
            ServerStatus::Inactive
        } else {
            ServerStatus::from_failures(failures, self.failure_threshold)
        };
        HealthSnapshot {
            server_id: self.server_id.clone(),
            consecutive_failures: failures,
            circuit,
            status,
            last_checked_at: millis_to_datetime(self.last_checked_ms.load(Ordering::Acquire)),
            next_probe_at: millis_to_datetime(self.next_probe_ms.load(Ordering::Acquire)),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
        }
    }
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        return None;
    }
    DateTime::from_timestamp_millis(ms)
}

/// Health state for every registered server, mirrored into the catalog.
pub struct HealthTracker {
    states: DashMap<ServerId, Arc<HealthState>>,
    catalog: Arc<ServerCatalog>,
    failure_threshold: u32,
}

impl HealthTracker {
    pub fn new(catalog: Arc<ServerCatalog>, failure_threshold: u32) -> Self {
        Self {
            states: DashMap::new(),
            catalog,
            failure_threshold,
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn state(&self, server_id: &ServerId) -> Arc<HealthState> {
        if let Some(state) = self.states.get(server_id) {
            return Arc::clone(&state);
        }
        Arc::clone(
            self.states
                .entry(server_id.clone())
                .or_insert_with(|| {
                    Arc::new(HealthState::new(server_id.clone(), self.failure_threshold))
                })
                .value(),
        )
    }

    /// Whether invocations against `server_id` are currently rejected.
    pub fn is_open(&self, server_id: &ServerId) -> bool {
        self.states
            .get(server_id)
            .map(|s| s.is_open())
            .unwrap_or(false)
    }

    pub fn record_success(&self, server_id: &ServerId) -> HealthSnapshot {
        let state = self.state(server_id);
        state.record_success();
        self.sync(state.snapshot(), false)
    }

    pub fn record_failure(&self, server_id: &ServerId, error: &BridgeError) -> HealthSnapshot {
        let state = self.state(server_id);
        state.record_failure();
        let snapshot = state.snapshot();
        warn!(
            server_id = %server_id,
            failures = snapshot.consecutive_failures,
            status = snapshot.status.as_str(),
            "Server failure recorded: {}",
            error
        );
        self.sync(snapshot, false)
    }

    /// Record the outcome of a health probe.
    pub fn record_probe(&self, server_id: &ServerId, error: Option<&BridgeError>) -> HealthSnapshot {
        let state = self.state(server_id);
        state.mark_checked();
        match error {
            None => state.record_success(),
            Some(e) => {
                state.record_failure();
                warn!(server_id = %server_id, "Health probe failed: {}", e);
            }
        }
        self.sync(state.snapshot(), true)
    }

    pub fn set_next_probe(&self, server_id: &ServerId, at: DateTime<Utc>) {
        self.state(server_id).set_next_probe(at);
    }

    pub fn snapshot(&self, server_id: &ServerId) -> Option<HealthSnapshot> {
        self.states.get(server_id).map(|s| s.snapshot())
    }

    pub fn forget(&self, server_id: &ServerId) {
        self.states.remove(server_id);
    }

    fn sync(&self, snapshot: HealthSnapshot, checked: bool) -> HealthSnapshot {
        self.catalog.apply_health(
            &snapshot.server_id,
            snapshot.consecutive_failures,
            snapshot.status,
            checked,
        );
        snapshot
    }
}
