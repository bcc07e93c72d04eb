//! Block Devices
//!
//! Host-local storage devices. A block device may back one DRBD volume and
//! carries the meta-data placement for that role.

use crate::state::device::DeviceStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index into an external meta-data device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaDiskIndex {
    /// Meta-data size follows the data device
    Flexible,
    /// Fixed 128MiB slot number
    Fixed(u32),
}

impl fmt::Display for MetaDiskIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaDiskIndex::Flexible => write!(f, "Flexible"),
            MetaDiskIndex::Fixed(index) => write!(f, "{}", index),
        }
    }
}

/// Where replication meta-data is stored
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaDisk {
    #[default]
    Internal,
    /// A separate block device on the same host
    External { device: String, index: MetaDiskIndex },
}

/// The volume a block device backs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRef {
    pub resource: String,
    pub volume: u32,
}

impl fmt::Display for VolumeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource, self.volume)
    }
}

/// A physical or logical storage device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDevice {
    /// Device path, e.g. `/dev/sdb1`
    pub path: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    /// Volume this device backs, if any
    #[serde(default)]
    pub drbd: Option<VolumeRef>,
    #[serde(default)]
    pub meta_disk: MetaDisk,
    /// Last observed runtime state; refreshed by the status poller
    #[serde(skip)]
    pub observed: DeviceStatus,
}

impl BlockDevice {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size_bytes: None,
            drbd: None,
            meta_disk: MetaDisk::Internal,
            observed: DeviceStatus::default(),
        }
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    pub fn with_meta_disk(mut self, meta_disk: MetaDisk) -> Self {
        self.meta_disk = meta_disk;
        self
    }

    pub fn is_drbd(&self) -> bool {
        self.drbd.is_some()
    }
}
