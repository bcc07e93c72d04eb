//! Cluster Hosts
//!
//! A host owns its block devices and the sets of TCP ports already taken
//! by DRBD connections and proxy relays.

use super::block_device::BlockDevice;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Host Facts
// =============================================================================

/// A network interface reported by host discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInterface {
    pub name: String,
    pub ip: String,
}

/// A logical volume reported by host discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalVolume {
    pub name: String,
    pub size_bytes: u64,
}

/// A volume group reported by host discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGroup {
    pub name: String,
    pub free_bytes: u64,
    #[serde(default)]
    pub logical_volumes: Vec<LogicalVolume>,
}

/// Already-parsed facts about a host, consumed read-only
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFacts {
    #[serde(default)]
    pub interfaces: Vec<NetInterface>,
    #[serde(default)]
    pub volume_groups: Vec<VolumeGroup>,
    /// Whether the drbd-proxy daemon is installed
    #[serde(default)]
    pub proxy_installed: bool,
}

// =============================================================================
// Host
// =============================================================================

/// A cluster member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    #[serde(default)]
    pub facts: HostFacts,
    /// Block devices keyed by path
    #[serde(default)]
    pub block_devices: BTreeMap<String, BlockDevice>,
    #[serde(default)]
    pub used_ports: BTreeSet<u16>,
    #[serde(default)]
    pub used_proxy_ports: BTreeSet<u16>,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            facts: HostFacts::default(),
            block_devices: BTreeMap::new(),
            used_ports: BTreeSet::new(),
            used_proxy_ports: BTreeSet::new(),
        }
    }

    pub fn with_facts(mut self, facts: HostFacts) -> Self {
        self.facts = facts;
        self
    }

    pub fn block_device(&self, path: &str) -> Option<&BlockDevice> {
        self.block_devices.get(path)
    }

    pub fn block_device_mut(&mut self, path: &str) -> Option<&mut BlockDevice> {
        self.block_devices.get_mut(path)
    }

    /// Addresses of all interfaces, in discovery order
    pub fn ip_addresses(&self) -> Vec<&str> {
        self.facts.interfaces.iter().map(|i| i.ip.as_str()).collect()
    }

    pub fn has_address(&self, ip: &str) -> bool {
        self.facts.interfaces.iter().any(|i| i.ip == ip)
    }

    pub fn can_relay(&self) -> bool {
        self.facts.proxy_installed
    }

    /// Logical volumes as `/dev/<vg>/<lv>` paths
    pub fn logical_volume_paths(&self) -> Vec<String> {
        self.facts
            .volume_groups
            .iter()
            .flat_map(|vg| {
                vg.logical_volumes
                    .iter()
                    .map(move |lv| format!("/dev/{}/{}", vg.name, lv.name))
            })
            .collect()
    }

    pub fn is_port_used(&self, port: u16) -> bool {
        self.used_ports.contains(&port)
    }

    pub fn is_proxy_port_used(&self, port: u16) -> bool {
        self.used_proxy_ports.contains(&port)
    }

    pub fn release_port(&mut self, port: u16) -> bool {
        self.used_ports.remove(&port)
    }

    pub fn release_proxy_port(&mut self, port: u16) -> bool {
        self.used_proxy_ports.remove(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_volume_paths() {
        let host = Host::new("alpha").with_facts(HostFacts {
            interfaces: vec![NetInterface {
                name: "eth0".into(),
                ip: "10.0.0.1".into(),
            }],
            volume_groups: vec![VolumeGroup {
                name: "vg0".into(),
                free_bytes: 0,
                logical_volumes: vec![
                    LogicalVolume {
                        name: "data".into(),
                        size_bytes: 1 << 30,
                    },
                    LogicalVolume {
                        name: "meta".into(),
                        size_bytes: 1 << 27,
                    },
                ],
            }],
            proxy_installed: false,
        });

        assert_eq!(
            host.logical_volume_paths(),
            vec!["/dev/vg0/data".to_string(), "/dev/vg0/meta".to_string()]
        );
        assert!(host.has_address("10.0.0.1"));
        assert!(!host.can_relay());
    }
}
