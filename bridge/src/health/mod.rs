//! Server health tracking and background probing.

pub mod monitor;
pub mod state;

pub use monitor::{HealthMonitor, HealthMonitorHandle};
pub use state::{CircuitState, HealthSnapshot, HealthState, HealthTracker};
