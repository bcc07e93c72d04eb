//! Domain layer - Port definitions
//!
//! This module defines the traits (ports) that external collaborators
//! implement: the command executor that reaches the cluster hosts and the
//! read-only DRBD parameter schema.

pub mod ports;

pub use ports::*;
