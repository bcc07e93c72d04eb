//! Resources
//!
//! A named aggregate of volumes plus the resource-level parameters,
//! network endpoints and proxy links shared by those volumes.

use super::proxy::ProxyLink;
use super::volume::Volume;
use crate::params::schema::RESYNC_AFTER_NONE;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(default)]
    pub volumes: BTreeMap<u32, Volume>,
    /// Saved parameter values
    #[serde(default)]
    pub params: IndexMap<String, String>,
    /// Resource-local defaults, consulted after saved values
    #[serde(default)]
    pub defaults: IndexMap<String, String>,
    /// Edits not yet applied
    #[serde(default)]
    pub pending: IndexMap<String, String>,
    /// Replication port shared by every host
    #[serde(default)]
    pub port: Option<u16>,
    /// Replication address per host
    #[serde(default)]
    pub addresses: BTreeMap<String, String>,
    /// Relay configuration per DRBD host
    #[serde(default)]
    pub proxy_links: BTreeMap<String, ProxyLink>,
    /// Set once the resource has been rendered into a deployed config
    #[serde(default)]
    pub committed: bool,
    #[serde(default)]
    pub committed_at: Option<DateTime<Utc>>,
}

impl Resource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            volumes: BTreeMap::new(),
            params: IndexMap::new(),
            defaults: IndexMap::new(),
            pending: IndexMap::new(),
            port: None,
            addresses: BTreeMap::new(),
            proxy_links: BTreeMap::new(),
            committed: false,
            committed_at: None,
        }
    }

    /// Hosts holding a block device of any volume
    pub fn hosts(&self) -> BTreeSet<String> {
        self.volumes
            .values()
            .flat_map(|v| v.devices.keys().cloned())
            .collect()
    }

    pub fn has_host(&self, host: &str) -> bool {
        self.volumes.values().any(|v| v.devices.contains_key(host))
    }

    /// Hosts running a relay for this resource
    pub fn proxy_hosts(&self) -> BTreeSet<String> {
        self.proxy_links
            .values()
            .map(|l| l.proxy_host.clone())
            .collect()
    }

    /// Member hosts plus relay hosts; every host that needs the config file
    pub fn involved_hosts(&self) -> BTreeSet<String> {
        let mut hosts = self.hosts();
        hosts.extend(self.proxy_hosts());
        hosts
    }

    pub fn has_proxy(&self) -> bool {
        !self.proxy_links.is_empty()
    }

    /// Whether `host` takes part in a relay as DRBD side or proxy side
    pub fn uses_proxy_on(&self, host: &str) -> bool {
        self.proxy_links.contains_key(host)
            || self.proxy_links.values().any(|l| l.proxy_host == host)
    }

    /// Next unused volume number
    pub fn next_volume_number(&self) -> u32 {
        self.volumes.keys().next_back().map(|n| n + 1).unwrap_or(0)
    }

    /// Saved resync-after target, `None` for the sentinel
    pub fn resync_after<'a>(&'a self, param: &str) -> Option<&'a str> {
        self.params
            .get(param)
            .map(String::as_str)
            .filter(|v| !v.is_empty() && *v != RESYNC_AFTER_NONE)
    }

    /// Queue an edit to be validated and applied later
    pub fn stage(&mut self, param: impl Into<String>, value: impl Into<String>) {
        self.pending.insert(param.into(), value.into());
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Move pending edits into saved values. An empty value clears the
    /// saved value.
    pub fn commit_pending(&mut self) {
        for (param, value) in std::mem::take(&mut self.pending) {
            if value.is_empty() {
                self.params.shift_remove(&param);
            } else {
                self.params.insert(param, value);
            }
        }
    }

    /// Copy of this resource with pending edits folded in
    pub fn with_pending_applied(&self) -> Resource {
        let mut preview = self.clone();
        preview.commit_pending();
        preview
    }

    pub(crate) fn mark_committed(&mut self) {
        self.committed = true;
        self.committed_at = Some(Utc::now());
    }
}
