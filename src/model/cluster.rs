//! Cluster Aggregate
//!
//! Owns every host, block device and resource, and keeps the cluster-wide
//! device path index. All invariants that span more than one entity are
//! enforced here.

use super::block_device::{BlockDevice, VolumeRef};
use super::host::Host;
use super::proxy::ProxyLink;
use super::resource::Resource;
use super::volume::{device_for_minor, minor_of, Volume};
use crate::domain::ports::DrbdSyntax;
use crate::error::{Error, Result};
use crate::params::resolver::check_resync_after;
use crate::params::schema::RESYNC_AFTER_NONE;
use crate::state::device::DeviceStatus;
use crate::state::status::StatusSnapshot;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cluster shared between concurrently running operations
pub type SharedCluster = Arc<RwLock<Cluster>>;

// =============================================================================
// Requests / Outcomes
// =============================================================================

/// Couple block devices on several hosts into one volume
#[derive(Debug, Clone)]
pub struct BindVolume {
    pub resource: String,
    /// Volume number; the next free one when absent
    pub volume: Option<u32>,
    /// DRBD device path; the lowest free `/dev/drbdN` when absent
    pub device: Option<String>,
    /// `(host, block device path)` pairs
    pub members: Vec<(String, String)>,
}

/// What an unbind removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnbindOutcome {
    pub volume: VolumeRef,
    /// The volume was the last one and the resource went with it
    pub resource_removed: bool,
}

// =============================================================================
// Cluster
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    #[serde(default)]
    pub syntax: DrbdSyntax,
    #[serde(default)]
    pub hosts: BTreeMap<String, Host>,
    #[serde(default)]
    pub resources: BTreeMap<String, Resource>,
    /// Values of the `global { }` section
    #[serde(default)]
    pub global: IndexMap<String, String>,
    /// Values of the `common { }` section
    #[serde(default)]
    pub common: IndexMap<String, String>,
    /// DRBD device path -> owning volume
    #[serde(skip)]
    device_index: BTreeMap<String, VolumeRef>,
}

impl Cluster {
    pub fn new(name: impl Into<String>, syntax: DrbdSyntax) -> Self {
        Self {
            name: name.into(),
            syntax,
            ..Default::default()
        }
    }

    pub fn into_shared(self) -> SharedCluster {
        Arc::new(RwLock::new(self))
    }

    /// Parse a YAML cluster description and rebuild derived indexes
    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut cluster: Cluster = serde_yaml::from_str(text)?;
        cluster.rebuild_index()?;
        Ok(cluster)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cluster = Self::from_yaml(&text)?;
        info!(
            "Loaded cluster {} from {}: {} hosts, {} resources",
            cluster.name,
            path.display(),
            cluster.hosts.len(),
            cluster.resources.len()
        );
        Ok(cluster)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Recompute the device index and the back references held by block
    /// devices, rejecting duplicated device paths
    pub fn rebuild_index(&mut self) -> Result<()> {
        self.device_index.clear();
        for host in self.hosts.values_mut() {
            for bd in host.block_devices.values_mut() {
                bd.drbd = None;
            }
        }

        for resource in self.resources.values() {
            for volume in resource.volumes.values() {
                let vref = VolumeRef {
                    resource: resource.name.clone(),
                    volume: volume.number,
                };
                if let Some(device) = &volume.device {
                    if let Some(existing) = self.device_index.get(device) {
                        return Err(Error::DuplicateDevicePath {
                            device: device.clone(),
                            resource: existing.resource.clone(),
                            volume: existing.volume,
                        });
                    }
                    self.device_index.insert(device.clone(), vref.clone());
                }
                for (host_name, path) in &volume.devices {
                    let bd = self
                        .hosts
                        .get_mut(host_name)
                        .ok_or_else(|| Error::HostNotFound {
                            host: host_name.clone(),
                        })?
                        .block_device_mut(path)
                        .ok_or_else(|| Error::BlockDeviceNotFound {
                            host: host_name.clone(),
                            device: path.clone(),
                        })?;
                    bd.drbd = Some(vref.clone());
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Hosts and block devices
    // =========================================================================

    pub fn add_host(&mut self, host: Host) -> Result<()> {
        if self.hosts.contains_key(&host.name) {
            return Err(Error::HostExists { host: host.name });
        }
        debug!("Adding host {}", host.name);
        self.hosts.insert(host.name.clone(), host);
        Ok(())
    }

    pub fn host(&self, name: &str) -> Result<&Host> {
        self.hosts.get(name).ok_or_else(|| Error::HostNotFound {
            host: name.to_string(),
        })
    }

    pub fn host_mut(&mut self, name: &str) -> Result<&mut Host> {
        self.hosts.get_mut(name).ok_or_else(|| Error::HostNotFound {
            host: name.to_string(),
        })
    }

    pub fn add_block_device(&mut self, host: &str, device: BlockDevice) -> Result<()> {
        let host = self.host_mut(host)?;
        host.block_devices.insert(device.path.clone(), device);
        Ok(())
    }

    pub fn block_device(&self, host: &str, path: &str) -> Result<&BlockDevice> {
        self.host(host)?
            .block_device(path)
            .ok_or_else(|| Error::BlockDeviceNotFound {
                host: host.to_string(),
                device: path.to_string(),
            })
    }

    // =========================================================================
    // Resources and volumes
    // =========================================================================

    pub fn resource(&self, name: &str) -> Result<&Resource> {
        self.resources.get(name).ok_or_else(|| Error::ResourceNotFound {
            resource: name.to_string(),
        })
    }

    pub fn resource_mut(&mut self, name: &str) -> Result<&mut Resource> {
        self.resources
            .get_mut(name)
            .ok_or_else(|| Error::ResourceNotFound {
                resource: name.to_string(),
            })
    }

    pub fn volume(&self, resource: &str, volume: u32) -> Result<&Volume> {
        self.resource(resource)?
            .volumes
            .get(&volume)
            .ok_or_else(|| Error::VolumeNotFound {
                resource: resource.to_string(),
                volume,
            })
    }

    /// Volume owning a DRBD device path
    pub fn volume_for_device(&self, device: &str) -> Option<&VolumeRef> {
        self.device_index.get(device)
    }

    /// Lowest minor number not used by any volume
    pub fn next_free_minor(&self) -> u32 {
        let mut minor = 0;
        while self.device_index.contains_key(&device_for_minor(minor)) {
            minor += 1;
        }
        minor
    }

    /// Bind block devices together as a volume, creating the resource when
    /// it does not exist yet
    pub fn bind_volume(&mut self, request: BindVolume) -> Result<VolumeRef> {
        if request.members.len() < 2 {
            return Err(Error::Configuration(format!(
                "volume of {} needs block devices on at least two hosts",
                request.resource
            )));
        }

        let mut seen_hosts = std::collections::BTreeSet::new();
        for (host, path) in &request.members {
            if !seen_hosts.insert(host.as_str()) {
                return Err(Error::Configuration(format!(
                    "host {} appears twice in volume of {}",
                    host, request.resource
                )));
            }
            let bd = self.block_device(host, path)?;
            if let Some(owner) = &bd.drbd {
                return Err(Error::BlockDeviceInUse {
                    host: host.clone(),
                    device: path.clone(),
                    resource: owner.resource.clone(),
                });
            }
        }

        let device = match request.device {
            Some(device) => {
                if let Some(owner) = self.device_index.get(&device) {
                    return Err(Error::DuplicateDevicePath {
                        device,
                        resource: owner.resource.clone(),
                        volume: owner.volume,
                    });
                }
                device
            }
            None => device_for_minor(self.next_free_minor()),
        };

        if self.syntax == DrbdSyntax::Legacy {
            if let Some(existing) = self.resources.get(&request.resource) {
                if !existing.volumes.is_empty() {
                    return Err(Error::Configuration(format!(
                        "legacy syntax allows one volume per resource ({})",
                        request.resource
                    )));
                }
            }
        }

        let resource = self
            .resources
            .entry(request.resource.clone())
            .or_insert_with(|| {
                info!("Creating resource {}", request.resource);
                Resource::new(request.resource.clone())
            });

        let number = request.volume.unwrap_or_else(|| resource.next_volume_number());
        if resource.volumes.contains_key(&number) {
            return Err(Error::VolumeExists {
                resource: request.resource,
                volume: number,
            });
        }

        let mut volume = Volume::new(number);
        volume.device = Some(device.clone());
        volume.devices = request.members.iter().cloned().collect();
        resource.volumes.insert(number, volume);

        let vref = VolumeRef {
            resource: request.resource.clone(),
            volume: number,
        };
        self.device_index.insert(device.clone(), vref.clone());
        for (host, path) in &request.members {
            if let Some(bd) = self
                .hosts
                .get_mut(host)
                .and_then(|h| h.block_device_mut(path))
            {
                bd.drbd = Some(vref.clone());
            }
        }

        info!("Bound volume {} as {}", vref, device);
        Ok(vref)
    }

    /// Change the DRBD device path of a volume
    pub fn set_volume_device(&mut self, resource: &str, volume: u32, device: &str) -> Result<()> {
        if minor_of(device).is_none() {
            return Err(Error::InvalidParameter {
                param: "DrbdDevice".into(),
                value: device.into(),
                reason: "must be /dev/drbd<minor>".into(),
            });
        }
        if let Some(owner) = self.device_index.get(device) {
            if owner.resource != resource || owner.volume != volume {
                return Err(Error::DuplicateDevicePath {
                    device: device.to_string(),
                    resource: owner.resource.clone(),
                    volume: owner.volume,
                });
            }
            return Ok(());
        }

        let vol = self
            .resource_mut(resource)?
            .volumes
            .get_mut(&volume)
            .ok_or_else(|| Error::VolumeNotFound {
                resource: resource.to_string(),
                volume,
            })?;
        let old = vol.device.replace(device.to_string());
        if let Some(old) = old {
            self.device_index.remove(&old);
        }
        self.device_index.insert(
            device.to_string(),
            VolumeRef {
                resource: resource.to_string(),
                volume,
            },
        );
        Ok(())
    }

    /// Remove a volume from the model. When it was the last volume the
    /// resource is removed as well.
    pub fn unbind_volume(&mut self, resource: &str, volume: u32) -> Result<UnbindOutcome> {
        let res = self.resource(resource)?;
        if !res.volumes.contains_key(&volume) {
            return Err(Error::VolumeNotFound {
                resource: resource.to_string(),
                volume,
            });
        }
        // the last volume goes with its resource, which still knows its
        // member hosts and can release their ports
        let now_empty = res.volumes.len() == 1;
        if now_empty {
            self.remove_resource(resource)?;
        } else if let Some(removed) = self.resource_mut(resource)?.volumes.remove(&volume) {
            if let Some(device) = &removed.device {
                self.device_index.remove(device);
            }
            for (host, path) in &removed.devices {
                if let Some(bd) = self
                    .hosts
                    .get_mut(host)
                    .and_then(|h| h.block_device_mut(path))
                {
                    bd.drbd = None;
                }
            }
        }

        info!("Unbound volume {}/{}", resource, volume);
        Ok(UnbindOutcome {
            volume: VolumeRef {
                resource: resource.to_string(),
                volume,
            },
            resource_removed: now_empty,
        })
    }

    /// Remove a resource with all its volumes, release its ports and drop
    /// resync-after references pointing at it
    pub fn remove_resource(&mut self, name: &str) -> Result<Resource> {
        let resource = self
            .resources
            .remove(name)
            .ok_or_else(|| Error::ResourceNotFound {
                resource: name.to_string(),
            })?;

        for volume in resource.volumes.values() {
            if let Some(device) = &volume.device {
                self.device_index.remove(device);
            }
            for (host, path) in &volume.devices {
                if let Some(bd) = self
                    .hosts
                    .get_mut(host)
                    .and_then(|h| h.block_device_mut(path))
                {
                    bd.drbd = None;
                }
            }
        }

        if let Some(port) = resource.port {
            for host in resource.hosts() {
                if let Some(h) = self.hosts.get_mut(&host) {
                    h.release_port(port);
                }
            }
        }
        for link in resource.proxy_links.values() {
            if let Some(h) = self.hosts.get_mut(&link.proxy_host) {
                h.release_proxy_port(link.inside.port);
                h.release_proxy_port(link.outside.port);
            }
        }

        let param = self.syntax.resync_after_param();
        for other in self.resources.values_mut() {
            if other.resync_after(param) == Some(name) {
                debug!("Dropping resync-after {} from {}", name, other.name);
                other.params.insert(param.to_string(), RESYNC_AFTER_NONE.to_string());
            }
        }

        info!("Removed resource {}", name);
        Ok(resource)
    }

    /// Rename a resource that has never been deployed
    pub fn rename_resource(&mut self, old: &str, new: &str) -> Result<()> {
        let resource = self.resource(old)?;
        if resource.committed {
            return Err(Error::ResourceCommitted {
                resource: old.to_string(),
            });
        }
        if self.resources.contains_key(new) {
            return Err(Error::ResourceExists {
                resource: new.to_string(),
            });
        }

        let mut resource = self.resources.remove(old).ok_or_else(|| Error::ResourceNotFound {
            resource: old.to_string(),
        })?;
        resource.name = new.to_string();
        self.resources.insert(new.to_string(), resource);

        let param = self.syntax.resync_after_param();
        for other in self.resources.values_mut() {
            if other.resync_after(param) == Some(old) {
                other.params.insert(param.to_string(), new.to_string());
            }
        }

        self.rebuild_index()?;
        info!("Renamed resource {} to {}", old, new);
        Ok(())
    }

    pub fn set_address(&mut self, resource: &str, host: &str, ip: &str) -> Result<()> {
        self.host(host)?;
        let res = self.resource_mut(resource)?;
        if !res.has_host(host) {
            return Err(Error::HostNotInResource {
                resource: resource.to_string(),
                host: host.to_string(),
            });
        }
        res.addresses.insert(host.to_string(), ip.to_string());
        Ok(())
    }

    pub fn set_proxy_link(&mut self, resource: &str, host: &str, link: ProxyLink) -> Result<()> {
        self.host(&link.proxy_host)?;
        let res = self.resource_mut(resource)?;
        if !res.has_host(host) {
            return Err(Error::HostNotInResource {
                resource: resource.to_string(),
                host: host.to_string(),
            });
        }
        res.proxy_links.insert(host.to_string(), link);
        Ok(())
    }

    /// Point a resource's resync-after at `target` (or `none`), refusing
    /// targets that would close a cycle
    pub fn set_resync_after(&mut self, resource: &str, target: &str) -> Result<()> {
        let param = self.syntax.resync_after_param();
        if target != RESYNC_AFTER_NONE {
            self.resource(target)?;
            check_resync_after(self, resource, target)?;
        }
        self.resource_mut(resource)?
            .params
            .insert(param.to_string(), target.to_string());
        Ok(())
    }

    /// Other member hosts of a resource
    pub fn peer_hosts(&self, resource: &str, host: &str) -> Result<Vec<String>> {
        Ok(self
            .resource(resource)?
            .hosts()
            .into_iter()
            .filter(|h| h != host)
            .collect())
    }

    // =========================================================================
    // Observed state
    // =========================================================================

    /// Refresh observed state of every DRBD-backed block device on `host`
    /// from a parsed status snapshot. Returns the number of devices updated.
    pub fn observe_status(&mut self, host: &str, snapshot: &StatusSnapshot) -> Result<usize> {
        let mut targets = Vec::new();
        for resource in self.resources.values() {
            for volume in resource.volumes.values() {
                if let (Some(minor), Some(path)) = (volume.minor(), volume.block_device_on(host)) {
                    targets.push((minor, path.to_string()));
                }
            }
        }

        let host = self.host_mut(host)?;
        let mut updated = 0;
        for (minor, path) in targets {
            let Some(bd) = host.block_device_mut(&path) else {
                warn!("Block device {} vanished from {}", path, host.name);
                continue;
            };
            match snapshot.device(minor) {
                Some(status) => {
                    // the kernel reports a split-brain once; it holds until
                    // the device reconnects
                    let split_brain = status.split_brain
                        || (bd.observed.split_brain && !status.is_connected());
                    bd.observed = DeviceStatus {
                        split_brain,
                        ..status.clone()
                    };
                    updated += 1;
                }
                None => {
                    bd.observed = Default::default();
                }
            }
        }
        Ok(updated)
    }

    /// Parse raw status text for `host` and observe it
    pub fn observe_status_text(&mut self, host: &str, text: &str) -> Result<usize> {
        let snapshot = StatusSnapshot::parse(text)?;
        let updated = self.observe_status(host, &snapshot)?;
        debug!("Observed {} device(s) on {}", updated, host);
        Ok(updated)
    }
}
