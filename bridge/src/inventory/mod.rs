//! Capability inventory.
//!
//! Normalized per-server tools, resources and prompts, with name
//! resolution across servers.

pub mod registry;
pub mod types;

pub use registry::CapabilityRegistry;
pub use types::{Capability, CapabilityKind, CapabilitySet, QualifiedCapability, ToolAssignment};
