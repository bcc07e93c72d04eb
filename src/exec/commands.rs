//! Command Lines
//!
//! Maps a [`DrbdCommand`] onto the shell line the executor runs. In test
//! mode `drbdadm` gets `-d` and `modprobe` gets `-n`, so the line only
//! prints what it would do.

use crate::domain::ports::{CommandRequest, DrbdCommand, DrbdSyntax, ExecMode};
use crate::error::{Error, Result};

const DRBDADM: &str = "drbdadm";
const DRBDSETUP: &str = "drbdsetup";

/// What a command is aimed at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandTarget {
    pub resource: Option<String>,
    pub volume: Option<u32>,
    pub minor: Option<u32>,
}

impl CommandTarget {
    pub fn resource(resource: impl Into<String>) -> Self {
        Self {
            resource: Some(resource.into()),
            ..Default::default()
        }
    }

    pub fn volume(resource: impl Into<String>, volume: u32) -> Self {
        Self {
            resource: Some(resource.into()),
            volume: Some(volume),
            minor: None,
        }
    }

    pub fn minor(minor: u32) -> Self {
        Self {
            minor: Some(minor),
            ..Default::default()
        }
    }
}

fn is_volume_scoped(command: DrbdCommand) -> bool {
    use DrbdCommand::*;
    matches!(
        command,
        Attach | Detach | Invalidate | Resize | Verify | PauseSync | ResumeSync | SkipInitialFullSync
    )
}

/// Builds command requests for one grammar generation
#[derive(Debug, Clone, Copy)]
pub struct CommandBuilder {
    syntax: DrbdSyntax,
}

impl CommandBuilder {
    pub fn new(syntax: DrbdSyntax) -> Self {
        Self { syntax }
    }

    /// `res` or `res/vol`, depending on the command and grammar
    fn object(&self, command: DrbdCommand, target: &CommandTarget) -> Result<String> {
        let resource = target.resource.as_deref().ok_or_else(|| {
            Error::Internal(format!("{} needs a resource", command))
        })?;
        match target.volume {
            Some(volume) if self.syntax.has_volumes() && is_volume_scoped(command) => {
                Ok(format!("{}/{}", resource, volume))
            }
            _ => Ok(resource.to_string()),
        }
    }

    fn drbdadm(&self, mode: ExecMode, config_file: Option<&str>, args: &str) -> String {
        let mut line = String::from(DRBDADM);
        if mode.is_test() {
            line.push_str(" -d");
        }
        if let Some(file) = config_file {
            line.push_str(" -c ");
            line.push_str(file);
        }
        line.push(' ');
        line.push_str(args);
        line
    }

    /// Shell line for a command
    pub fn line(
        &self,
        command: DrbdCommand,
        target: &CommandTarget,
        mode: ExecMode,
        config_file: Option<&str>,
    ) -> Result<String> {
        use DrbdCommand::*;
        let sub = match command {
            Load => {
                return Ok(if mode.is_test() {
                    "modprobe -n drbd".to_string()
                } else {
                    "modprobe drbd".to_string()
                })
            }
            DelMinor => {
                let minor = target
                    .minor
                    .ok_or_else(|| Error::Internal("delete minor needs a minor number".into()))?;
                return Ok(format!("{} del-minor {}", DRBDSETUP, minor));
            }
            DelConnection => {
                let resource = self.object(command, target)?;
                return Ok(format!("{} disconnect {}", DRBDSETUP, resource));
            }
            SkipInitialFullSync if self.syntax == DrbdSyntax::Legacy => {
                let object = self.object(command, target)?;
                return Ok(self.drbdadm(
                    mode,
                    config_file,
                    &format!("-- --clear-bitmap new-current-uuid {}", object),
                ));
            }
            SkipInitialFullSync => "new-current-uuid --clear-bitmap",
            Attach => "attach",
            Detach => "detach",
            Connect => "connect",
            Disconnect => "disconnect",
            Up => "up",
            Down => "down",
            SetPrimary => "primary",
            SetSecondary => "secondary",
            Invalidate => "invalidate",
            DiscardData => "connect --discard-my-data",
            Resize => "resize",
            Verify => "verify",
            PauseSync => "pause-sync",
            ResumeSync => "resume-sync",
            ProxyUp => "proxy-up",
            ProxyDown => "proxy-down",
            Adjust => "adjust",
        };
        let object = self.object(command, target)?;
        Ok(self.drbdadm(mode, config_file, &format!("{} {}", sub, object)))
    }

    /// Full request for a command on a host
    pub fn request(
        &self,
        host: &str,
        command: DrbdCommand,
        target: &CommandTarget,
        mode: ExecMode,
        config_file: Option<&str>,
    ) -> Result<CommandRequest> {
        Ok(CommandRequest {
            host: host.to_string(),
            command,
            resource: target.resource.clone(),
            volume: target.volume,
            minor: target.minor,
            config_file: config_file.map(str::to_string),
            line: self.line(command, target, mode, config_file)?,
            mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drbdadm_lines() {
        let modern = CommandBuilder::new(DrbdSyntax::Modern);
        let vol = CommandTarget::volume("r0", 1);
        assert_eq!(
            modern.line(DrbdCommand::Attach, &vol, ExecMode::Live, None).unwrap(),
            "drbdadm attach r0/1"
        );
        assert_eq!(
            modern.line(DrbdCommand::Connect, &vol, ExecMode::Live, None).unwrap(),
            "drbdadm connect r0"
        );
        assert_eq!(
            modern
                .line(DrbdCommand::Adjust, &vol, ExecMode::Test, Some("/etc/drbd.d/r0.res.dry"))
                .unwrap(),
            "drbdadm -d -c /etc/drbd.d/r0.res.dry adjust r0"
        );
        assert_eq!(
            modern.line(DrbdCommand::DiscardData, &vol, ExecMode::Live, None).unwrap(),
            "drbdadm connect --discard-my-data r0"
        );
    }

    #[test]
    fn test_special_lines() {
        let modern = CommandBuilder::new(DrbdSyntax::Modern);
        let legacy = CommandBuilder::new(DrbdSyntax::Legacy);
        let vol = CommandTarget::volume("r0", 0);

        assert_eq!(
            modern.line(DrbdCommand::Load, &vol, ExecMode::Test, None).unwrap(),
            "modprobe -n drbd"
        );
        assert_eq!(
            modern
                .line(DrbdCommand::DelMinor, &CommandTarget::minor(3), ExecMode::Live, None)
                .unwrap(),
            "drbdsetup del-minor 3"
        );
        assert_eq!(
            modern.line(DrbdCommand::SkipInitialFullSync, &vol, ExecMode::Live, None).unwrap(),
            "drbdadm new-current-uuid --clear-bitmap r0/0"
        );
        assert_eq!(
            legacy.line(DrbdCommand::SkipInitialFullSync, &vol, ExecMode::Live, None).unwrap(),
            "drbdadm -- --clear-bitmap new-current-uuid r0"
        );
        assert_eq!(
            legacy.line(DrbdCommand::Attach, &vol, ExecMode::Live, None).unwrap(),
            "drbdadm attach r0"
        );
        assert!(modern
            .line(DrbdCommand::Attach, &CommandTarget::default(), ExecMode::Live, None)
            .is_err());
    }
}
