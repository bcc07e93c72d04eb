//! Status Parsing
//!
//! Turns raw `/proc/drbd` text, optionally followed by kernel log lines,
//! into per-minor [`DeviceStatus`] records.
//!
//! ```text
//!  0: cs:SyncSource ro:Primary/Secondary ds:UpToDate/Inconsistent C r-----
//!     [===>................] sync'ed: 21.4% (80/100)M
//! block drbd1: Split-Brain detected but unresolved, dropping connection!
//! ```

use super::device::{ConnectionState, DeviceStatus, DiskState, Role};
use crate::error::{Error, Result};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

fn minor_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d+):\s+(.*)$").expect("valid minor line regex"))
}

fn progress_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:sync'ed|verified):\s*([0-9]+(?:\.[0-9]+)?)%").expect("valid progress regex")
    })
}

fn split_brain_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)drbd(\d+):\s*split-brain detected").expect("valid split-brain regex")
    })
}

/// Parsed status of every minor on one host
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSnapshot {
    pub devices: BTreeMap<u32, DeviceStatus>,
}

impl StatusSnapshot {
    pub fn parse(text: &str) -> Result<Self> {
        let mut devices: BTreeMap<u32, DeviceStatus> = BTreeMap::new();
        let mut split_brain = BTreeSet::new();
        let mut current: Option<u32> = None;

        for (index, line) in text.lines().enumerate() {
            if let Some(caps) = split_brain_line().captures(line) {
                if let Ok(minor) = caps[1].parse::<u32>() {
                    split_brain.insert(minor);
                }
                continue;
            }

            if let Some(caps) = minor_line().captures(line) {
                let minor: u32 = caps[1]
                    .parse()
                    .map_err(|_| Error::StatusParse(format!("line {}: bad minor", index + 1)))?;
                let status = parse_fields(minor, &caps[2])
                    .map_err(|reason| Error::StatusParse(format!("line {}: {}", index + 1, reason)))?;
                devices.insert(minor, status);
                current = Some(minor);
                continue;
            }

            if let (Some(minor), Some(caps)) = (current, progress_line().captures(line)) {
                if let (Some(status), Ok(percent)) = (devices.get_mut(&minor), caps[1].parse::<f32>()) {
                    status.sync_percent = Some(percent);
                }
            }
        }

        for minor in split_brain {
            if let Some(status) = devices.get_mut(&minor) {
                status.split_brain = !status.is_connected();
            }
        }

        Ok(Self { devices })
    }

    pub fn device(&self, minor: u32) -> Option<&DeviceStatus> {
        self.devices.get(&minor)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

fn split_pair(value: &str) -> (&str, &str) {
    value.split_once('/').unwrap_or((value, ""))
}

fn parse_fields(minor: u32, fields: &str) -> std::result::Result<DeviceStatus, String> {
    let mut status = DeviceStatus {
        minor: Some(minor),
        ..Default::default()
    };
    let mut saw_connection = false;

    for field in fields.split_whitespace() {
        let Some((key, value)) = field.split_once(':') else {
            continue;
        };
        match key {
            "cs" => {
                status.connection = value.parse().unwrap_or_default();
                saw_connection = true;
            }
            "ro" | "st" => {
                let (local, peer) = split_pair(value);
                status.role = local.parse().unwrap_or(Role::Unknown);
                status.peer_role = peer.parse().unwrap_or(Role::Unknown);
            }
            "ds" => {
                let (local, peer) = split_pair(value);
                status.disk = local.parse().unwrap_or(DiskState::Unknown);
                status.peer_disk = peer.parse().unwrap_or(DiskState::Unknown);
            }
            _ => {}
        }
    }

    if !saw_connection {
        return Err(format!("minor {} has no connection state", minor));
    }
    if status.connection == ConnectionState::Unconfigured {
        status.disk = DiskState::Diskless;
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_DRBD: &str = "\
version: 8.4.11 (api:1/proto:86-101)
srcversion: 2A1B3C4D5E6F
 0: cs:Connected ro:Primary/Secondary ds:UpToDate/UpToDate C r-----
    ns:1024 nr:0 dw:1024 dr:2048 al:0 bm:0 lo:0 pe:0 ua:0 ap:0 ep:1 wo:f oos:0
 1: cs:SyncTarget ro:Secondary/Primary ds:Inconsistent/UpToDate C r-----
    ns:0 nr:4096 dw:4096 dr:0 al:0 bm:0 lo:0 pe:0 ua:0 ap:0 ep:1 wo:f oos:81920
\t[===>................] sync'ed: 21.4% (80/100)M
 2: cs:StandAlone ro:Secondary/Unknown ds:UpToDate/DUnknown   r-----
 3: cs:Unconfigured
block drbd2: Split-Brain detected but unresolved, dropping connection!
";

    #[test]
    fn test_parse_proc_drbd() {
        let snapshot = StatusSnapshot::parse(PROC_DRBD).unwrap();
        assert_eq!(snapshot.len(), 4);

        let d0 = snapshot.device(0).unwrap();
        assert!(d0.is_primary());
        assert!(d0.is_connected());
        assert!(d0.is_up_to_date());
        assert_eq!(d0.sync_percent, None);

        let d1 = snapshot.device(1).unwrap();
        assert!(d1.is_sync_target());
        assert!(d1.is_peer_primary());
        assert_eq!(d1.sync_percent, Some(21.4));

        let d2 = snapshot.device(2).unwrap();
        assert!(d2.is_split_brain());
        assert_eq!(d2.peer_role, Role::Unknown);

        let d3 = snapshot.device(3).unwrap();
        assert!(d3.is_diskless());
        assert!(!d3.is_connected_or_waiting());
    }

    #[test]
    fn test_split_brain_cleared_when_connected() {
        let text = " 0: cs:Connected ro:Secondary/Secondary ds:UpToDate/UpToDate C r-----\n\
                    drbd0: Split-Brain detected, dropping connection!\n";
        let snapshot = StatusSnapshot::parse(text).unwrap();
        assert!(!snapshot.device(0).unwrap().is_split_brain());
    }

    #[test]
    fn test_malformed_minor_line() {
        let result = StatusSnapshot::parse(" 4: ro:Primary/Secondary\n");
        assert!(matches!(result, Err(Error::StatusParse(_))));
        assert!(StatusSnapshot::parse("").unwrap().is_empty());
    }
}
