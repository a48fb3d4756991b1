//! Operator-facing pieces of the tool bridge: the YAML service
//! configuration and process-wide logging and metrics setup. The bridge
//! itself lives in `toolbridge_core`.

pub mod config;
pub mod observability;
