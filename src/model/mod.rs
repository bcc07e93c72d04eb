//! Domain Model
//!
//! Hosts, block devices, resources and volumes, held together by the
//! [`Cluster`] aggregate.

pub mod block_device;
pub mod cluster;
pub mod host;
pub mod proxy;
pub mod resource;
pub mod volume;

pub use block_device::*;
pub use cluster::*;
pub use host::*;
pub use proxy::*;
pub use resource::*;
pub use volume::*;
