//! Command Guards
//!
//! Pure predicates deciding which operator commands are legal for a device
//! in its observed state. A denial carries the reason shown to the operator.

use super::device::{ConnectionState, DeviceStatus, DiskState, Role};
use crate::domain::ports::DrbdCommand;
use crate::error::{Error, Result};

/// Why a command is not allowed right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Denied(pub &'static str);

pub type Verdict = std::result::Result<(), Denied>;

const FULL_SYNC: Denied = Denied("it is being full-synced");

fn deny_if(condition: bool, reason: &'static str) -> Verdict {
    if condition {
        Err(Denied(reason))
    } else {
        Ok(())
    }
}

/// Breaking a connection mid-sync is only safe from the side that cannot
/// end up with half-written data
fn disconnect_safe_while_syncing(status: &DeviceStatus) -> bool {
    status.is_sync_source() || (status.is_sync_target() && status.is_peer_primary())
}

/// Decide whether `command` may run on a device in `status`
pub fn check(command: DrbdCommand, status: &DeviceStatus) -> Verdict {
    use DrbdCommand::*;
    match command {
        Attach => deny_if(!status.is_diskless(), "it is already attached"),
        Detach => {
            deny_if(status.is_diskless(), "it is not attached")?;
            if status.is_syncing() {
                return Err(FULL_SYNC);
            }
            Ok(())
        }
        Connect => deny_if(status.is_connected_or_waiting(), "it is already connected"),
        Disconnect => {
            deny_if(!status.is_connected_or_waiting(), "it is not connected")?;
            if status.is_syncing() && !disconnect_safe_while_syncing(status) {
                return Err(FULL_SYNC);
            }
            Ok(())
        }
        SetPrimary => deny_if(status.is_primary(), "it is already primary"),
        SetSecondary => deny_if(!status.is_primary(), "it is not primary"),
        Invalidate | DiscardData => {
            if status.is_syncing() {
                return Err(FULL_SYNC);
            }
            deny_if(status.is_verifying(), "it is being verified")
        }
        Resize => {
            if status.is_syncing() {
                return Err(FULL_SYNC);
            }
            Ok(())
        }
        Verify => {
            deny_if(!status.is_connected(), "it is not connected")?;
            if status.is_syncing() {
                return Err(FULL_SYNC);
            }
            deny_if(status.is_verifying(), "it is already being verified")?;
            deny_if(
                !status.is_up_to_date() || status.peer_disk != DiskState::UpToDate,
                "both disks must be up to date",
            )
        }
        PauseSync => {
            deny_if(!status.is_syncing(), "it is not syncing")?;
            deny_if(status.is_paused_sync(), "sync is already paused")
        }
        ResumeSync => deny_if(!status.is_paused_sync(), "sync is not paused"),
        SkipInitialFullSync => {
            deny_if(
                status.connection != ConnectionState::Connected,
                "it is not connected",
            )?;
            deny_if(
                !status.is_inconsistent() || status.peer_disk != DiskState::Inconsistent,
                "both disks must be inconsistent",
            )?;
            deny_if(
                !status.is_secondary() || status.peer_role != Role::Secondary,
                "both sides must be secondary",
            )
        }
        Load | Up | Down | ProxyUp | ProxyDown | DelMinor | DelConnection | Adjust => Ok(()),
    }
}

pub fn permitted(command: DrbdCommand, status: &DeviceStatus) -> bool {
    check(command, status).is_ok()
}

/// Like [`check`], turning a denial into [`Error::CommandNotPermitted`]
pub fn require(command: DrbdCommand, status: &DeviceStatus, device: &str) -> Result<()> {
    check(command, status).map_err(|Denied(reason)| Error::CommandNotPermitted {
        command: command.to_string(),
        device: device.to_string(),
        reason: reason.to_string(),
    })
}

/// Commands offered for a device in its current state
pub fn available_commands(status: &DeviceStatus) -> Vec<DrbdCommand> {
    use DrbdCommand::*;
    [
        Attach,
        Detach,
        Connect,
        Disconnect,
        SetPrimary,
        SetSecondary,
        Invalidate,
        DiscardData,
        Resize,
        Verify,
        PauseSync,
        ResumeSync,
        SkipInitialFullSync,
    ]
    .into_iter()
    .filter(|c| permitted(*c, status))
    .collect()
}
