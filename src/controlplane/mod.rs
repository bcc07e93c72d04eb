//! Control Plane Module
//!
//! Manager configuration and the apply coordinator that pushes rendered
//! configuration to the cluster hosts.

pub mod config;
pub mod orchestrator;

pub use config::*;
pub use orchestrator::*;
