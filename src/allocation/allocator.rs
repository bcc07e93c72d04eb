//! Port Allocator
//!
//! Ports are chosen per host set: a port is free only when no involved host
//! has it in its used set and no resource on those hosts has it reserved.
//! All mutation goes through the cluster write lock.

use crate::error::{Error, Result};
use crate::model::cluster::{Cluster, SharedCluster};
use crate::model::proxy::{Endpoint, ProxyLink};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// First replication port handed out on an empty cluster
pub const DEFAULT_DRBD_PORT: u16 = 7788;

/// First proxy port handed out on an empty cluster
pub const DEFAULT_PROXY_PORT: u16 = 7788;

/// Number of free ports offered to an operator by default
pub const DEFAULT_PORT_CANDIDATES: usize = 10;

// =============================================================================
// Proxy Port Pair
// =============================================================================

/// Inside/outside ports for one relay. `outside < inside - 1` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyPortPair {
    pub inside: u16,
    pub outside: u16,
}

impl ProxyPortPair {
    pub fn is_ordered(&self) -> bool {
        (self.outside as u32) + 1 < self.inside as u32
    }
}

// =============================================================================
// Port Allocator
// =============================================================================

#[derive(Debug, Clone)]
pub struct PortAllocator {
    default_port: u16,
    default_proxy_port: u16,
    candidates: usize,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_DRBD_PORT, DEFAULT_PROXY_PORT, DEFAULT_PORT_CANDIDATES)
    }
}

impl PortAllocator {
    pub fn new(default_port: u16, default_proxy_port: u16, candidates: usize) -> Self {
        Self {
            default_port,
            default_proxy_port,
            candidates,
        }
    }

    /// DRBD ports taken on `hosts`, including reservations of resources
    /// that have not been deployed yet
    fn ports_in_use(cluster: &Cluster, hosts: &[&str]) -> Result<BTreeSet<u16>> {
        let mut used = BTreeSet::new();
        for name in hosts {
            used.extend(cluster.host(name)?.used_ports.iter().copied());
            used.extend(
                cluster
                    .resources
                    .values()
                    .filter(|r| r.has_host(name))
                    .filter_map(|r| r.port),
            );
        }
        Ok(used)
    }

    /// Proxy ports taken on `hosts`, including reservations
    fn proxy_ports_in_use(cluster: &Cluster, hosts: &[&str]) -> Result<BTreeSet<u16>> {
        let mut used = BTreeSet::new();
        for name in hosts {
            used.extend(cluster.host(name)?.used_proxy_ports.iter().copied());
            for link in cluster
                .resources
                .values()
                .flat_map(|r| r.proxy_links.values())
                .filter(|l| l.proxy_host == *name)
            {
                used.insert(link.inside.port);
                used.insert(link.outside.port);
            }
        }
        Ok(used)
    }

    fn above_max(used: &BTreeSet<u16>, default: u16, hosts: &[&str]) -> Result<u16> {
        match used.iter().next_back() {
            None => Ok(default),
            Some(&max) => max.checked_add(1).ok_or_else(|| Error::PortsExhausted {
                hosts: hosts.join(","),
            }),
        }
    }

    /// One more than the highest port used on any of `hosts`, or the
    /// default port when none is used yet
    pub fn lowest_unused_port(&self, cluster: &Cluster, hosts: &[&str]) -> Result<u16> {
        let used = Self::ports_in_use(cluster, hosts)?;
        Self::above_max(&used, self.default_port, hosts)
    }

    /// Same rule applied to the proxy port sets
    pub fn lowest_unused_proxy_port(&self, cluster: &Cluster, hosts: &[&str]) -> Result<u16> {
        let used = Self::proxy_ports_in_use(cluster, hosts)?;
        Self::above_max(&used, self.default_proxy_port, hosts)
    }

    /// Outside port first, then the smallest free inside port keeping
    /// `outside < inside - 1`
    pub fn propose_proxy_ports(&self, cluster: &Cluster, hosts: &[&str]) -> Result<ProxyPortPair> {
        let used = Self::proxy_ports_in_use(cluster, hosts)?;
        let outside = Self::above_max(&used, self.default_proxy_port, hosts)?;
        let inside = (outside as u32 + 2..=u16::MAX as u32)
            .map(|p| p as u16)
            .find(|p| !used.contains(p))
            .ok_or_else(|| Error::PortsExhausted {
                hosts: hosts.join(","),
            })?;
        let pair = ProxyPortPair { inside, outside };
        debug!("Proposed proxy ports {:?} for {}", pair, hosts.join(","));
        Ok(pair)
    }

    /// Free ports for a selector, starting at `preferred` (or the lowest
    /// unused port) and counting upwards
    pub fn port_candidates(
        &self,
        cluster: &Cluster,
        hosts: &[&str],
        preferred: Option<u16>,
    ) -> Result<Vec<u16>> {
        let used = Self::ports_in_use(cluster, hosts)?;
        let start = match preferred {
            Some(port) => port,
            None => Self::above_max(&used, self.default_port, hosts)?,
        };
        Ok((start..=u16::MAX)
            .filter(|p| !used.contains(p))
            .take(self.candidates)
            .collect())
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Mark a DRBD port used on every host. Fails without changing anything
    /// when one of the hosts already uses it.
    pub fn commit_port(&self, cluster: &mut Cluster, hosts: &[&str], port: u16) -> Result<()> {
        for name in hosts {
            if cluster.host(name)?.is_port_used(port) {
                return Err(Error::DuplicatePort {
                    host: name.to_string(),
                    port,
                });
            }
        }
        for name in hosts {
            cluster.host_mut(name)?.used_ports.insert(port);
        }
        info!("Committed port {} on {}", port, hosts.join(","));
        Ok(())
    }

    /// Mark a proxy port pair used on the relay host
    pub fn commit_proxy_ports(&self, cluster: &mut Cluster, proxy_host: &str, pair: ProxyPortPair) -> Result<()> {
        let host = cluster.host(proxy_host)?;
        for port in [pair.inside, pair.outside] {
            if host.is_proxy_port_used(port) {
                return Err(Error::DuplicatePort {
                    host: proxy_host.to_string(),
                    port,
                });
            }
        }
        let host = cluster.host_mut(proxy_host)?;
        host.used_proxy_ports.insert(pair.inside);
        host.used_proxy_ports.insert(pair.outside);
        info!(
            "Committed proxy ports inside {} outside {} on {}",
            pair.inside, pair.outside, proxy_host
        );
        Ok(())
    }

    // =========================================================================
    // Resource Assignment
    // =========================================================================

    /// Reserve the lowest free port for a resource across its hosts. The
    /// port becomes used on the hosts once the resource is applied.
    pub fn assign_resource_port(&self, cluster: &SharedCluster, resource: &str) -> Result<u16> {
        let mut cluster = cluster.write();
        if let Some(port) = cluster.resource(resource)?.port {
            return Ok(port);
        }
        let hosts = cluster.resource(resource)?.hosts();
        let hosts: Vec<&str> = hosts.iter().map(String::as_str).collect();
        let port = self.lowest_unused_port(&cluster, &hosts)?;
        cluster.resource_mut(resource)?.port = Some(port);
        debug!("Reserved port {} for {}", port, resource);
        Ok(port)
    }

    /// Route `host`'s side of a resource through a relay, reserving a
    /// port pair on the relay host
    pub fn assign_proxy_link(
        &self,
        cluster: &SharedCluster,
        resource: &str,
        host: &str,
        proxy_host: &str,
        inside_ip: &str,
        outside_ip: &str,
    ) -> Result<ProxyLink> {
        let mut cluster = cluster.write();
        let pair = self.propose_proxy_ports(&cluster, &[proxy_host])?;
        let link = ProxyLink::new(
            proxy_host,
            Endpoint::new(inside_ip, pair.inside),
            Endpoint::new(outside_ip, pair.outside),
        );
        cluster.set_proxy_link(resource, host, link.clone())?;
        debug!("Reserved proxy link {:?} for {} on {}", pair, resource, host);
        Ok(link)
    }
}
