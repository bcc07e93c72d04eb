//! Allocation Module
//!
//! Assigns replication ports and proxy port pairs without collisions
//! across the hosts involved in a resource.

pub mod allocator;

pub use allocator::*;
