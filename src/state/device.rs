//! Observed Device State
//!
//! Runtime attributes of a DRBD-backed block device as reported by the
//! status poller. Nothing here is computed by the manager; it only exposes
//! predicates over what was observed.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

// =============================================================================
// Role
// =============================================================================

/// Replication role of one side of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Role {
    Primary,
    Secondary,
    #[default]
    Unknown,
}

impl FromStr for Role {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Primary" => Role::Primary,
            "Secondary" => Role::Secondary,
            _ => Role::Unknown,
        })
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "Primary"),
            Role::Secondary => write!(f, "Secondary"),
            Role::Unknown => write!(f, "Unknown"),
        }
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Connection state (`cs:` field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    Unconfigured,
    StandAlone,
    Disconnecting,
    Disconnected,
    Unconnected,
    Timeout,
    BrokenPipe,
    NetworkFailure,
    ProtocolError,
    TearDown,
    WfConnection,
    WfReportParams,
    Connected,
    StartingSyncS,
    StartingSyncT,
    WfBitMapS,
    WfBitMapT,
    WfSyncUuid,
    SyncSource,
    SyncTarget,
    PausedSyncS,
    PausedSyncT,
    VerifyS,
    VerifyT,
    #[default]
    Unknown,
}

impl FromStr for ConnectionState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use ConnectionState::*;
        Ok(match s {
            "Unconfigured" => Unconfigured,
            "StandAlone" => StandAlone,
            "Disconnecting" => Disconnecting,
            "Disconnected" => Disconnected,
            "Unconnected" => Unconnected,
            "Timeout" => Timeout,
            "BrokenPipe" => BrokenPipe,
            "NetworkFailure" => NetworkFailure,
            "ProtocolError" => ProtocolError,
            "TearDown" => TearDown,
            "WFConnection" | "WfConnection" => WfConnection,
            "WFReportParams" | "WfReportParams" => WfReportParams,
            "Connected" => Connected,
            "StartingSyncS" => StartingSyncS,
            "StartingSyncT" => StartingSyncT,
            "WFBitMapS" | "WfBitMapS" => WfBitMapS,
            "WFBitMapT" | "WfBitMapT" => WfBitMapT,
            "WFSyncUUID" | "WfSyncUuid" => WfSyncUuid,
            "SyncSource" => SyncSource,
            "SyncTarget" => SyncTarget,
            "PausedSyncS" => PausedSyncS,
            "PausedSyncT" => PausedSyncT,
            "VerifyS" => VerifyS,
            "VerifyT" => VerifyT,
            _ => Unknown,
        })
    }
}

// =============================================================================
// Disk State
// =============================================================================

/// Disk state (`ds:` field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DiskState {
    Diskless,
    Attaching,
    Failed,
    Negotiating,
    Inconsistent,
    Outdated,
    DUnknown,
    Consistent,
    UpToDate,
    #[default]
    Unknown,
}

impl FromStr for DiskState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use DiskState::*;
        Ok(match s {
            "Diskless" => Diskless,
            "Attaching" => Attaching,
            "Failed" => Failed,
            "Negotiating" => Negotiating,
            "Inconsistent" => Inconsistent,
            "Outdated" => Outdated,
            "DUnknown" => DUnknown,
            "Consistent" => Consistent,
            "UpToDate" => UpToDate,
            _ => Unknown,
        })
    }
}

// =============================================================================
// Device Status
// =============================================================================

/// Snapshot of one device's observed state, including what it reports
/// about its peer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub minor: Option<u32>,
    pub role: Role,
    pub peer_role: Role,
    pub connection: ConnectionState,
    pub disk: DiskState,
    pub peer_disk: DiskState,
    /// Progress of a running resync or verify, in percent
    pub sync_percent: Option<f32>,
    pub split_brain: bool,
}

impl DeviceStatus {
    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    pub fn is_secondary(&self) -> bool {
        self.role == Role::Secondary
    }

    pub fn is_peer_primary(&self) -> bool {
        self.peer_role == Role::Primary
    }

    /// Connected to the peer, whether idle, syncing or verifying
    pub fn is_connected(&self) -> bool {
        use ConnectionState::*;
        matches!(
            self.connection,
            Connected
                | StartingSyncS
                | StartingSyncT
                | WfBitMapS
                | WfBitMapT
                | WfSyncUuid
                | SyncSource
                | SyncTarget
                | PausedSyncS
                | PausedSyncT
                | VerifyS
                | VerifyT
        )
    }

    pub fn is_wf_connection(&self) -> bool {
        matches!(
            self.connection,
            ConnectionState::WfConnection | ConnectionState::WfReportParams
        )
    }

    pub fn is_connected_or_waiting(&self) -> bool {
        self.is_connected() || self.is_wf_connection()
    }

    pub fn is_sync_source(&self) -> bool {
        use ConnectionState::*;
        matches!(self.connection, SyncSource | PausedSyncS | StartingSyncS | WfBitMapS)
    }

    pub fn is_sync_target(&self) -> bool {
        use ConnectionState::*;
        matches!(
            self.connection,
            SyncTarget | PausedSyncT | StartingSyncT | WfBitMapT | WfSyncUuid
        )
    }

    pub fn is_syncing(&self) -> bool {
        self.is_sync_source() || self.is_sync_target()
    }

    pub fn is_paused_sync(&self) -> bool {
        matches!(
            self.connection,
            ConnectionState::PausedSyncS | ConnectionState::PausedSyncT
        )
    }

    pub fn is_verifying(&self) -> bool {
        matches!(self.connection, ConnectionState::VerifyS | ConnectionState::VerifyT)
    }

    pub fn is_diskless(&self) -> bool {
        matches!(self.disk, DiskState::Diskless | DiskState::Unknown)
    }

    pub fn is_attached(&self) -> bool {
        !self.is_diskless()
    }

    pub fn is_split_brain(&self) -> bool {
        self.split_brain
    }

    pub fn is_up_to_date(&self) -> bool {
        self.disk == DiskState::UpToDate
    }

    pub fn is_inconsistent(&self) -> bool {
        self.disk == DiskState::Inconsistent
    }
}
