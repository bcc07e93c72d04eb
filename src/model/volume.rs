//! Volumes
//!
//! A numbered device mapping inside a resource. It couples one block
//! device per participating host under a single `/dev/drbdN` path.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Prefix of DRBD device paths
pub const DRBD_DEVICE_PREFIX: &str = "/dev/drbd";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume number, unique within the resource
    pub number: u32,
    /// DRBD device path, unique cluster-wide
    #[serde(default)]
    pub device: Option<String>,
    /// Backing block device path per host
    #[serde(default)]
    pub devices: BTreeMap<String, String>,
    /// Saved per-volume parameter values
    #[serde(default)]
    pub params: IndexMap<String, String>,
}

impl Volume {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            device: None,
            devices: BTreeMap::new(),
            params: IndexMap::new(),
        }
    }

    /// Backing device path on a host
    pub fn block_device_on(&self, host: &str) -> Option<&str> {
        self.devices.get(host).map(String::as_str)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    /// Minor number derived from the device path
    pub fn minor(&self) -> Option<u32> {
        self.device.as_deref().and_then(minor_of)
    }
}

/// Minor number of a `/dev/drbdN` path
pub fn minor_of(device: &str) -> Option<u32> {
    device.strip_prefix(DRBD_DEVICE_PREFIX)?.parse().ok()
}

/// Device path of a minor number
pub fn device_for_minor(minor: u32) -> String {
    format!("{}{}", DRBD_DEVICE_PREFIX, minor)
}
