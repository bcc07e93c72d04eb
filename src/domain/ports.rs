//! Domain Ports - Core trait definitions for the DRBD manager
//!
//! These traits define the boundaries between the configuration/orchestration
//! core and external systems. The remote transport that actually runs shell
//! commands on a host implements [`CommandExecutor`]; the DRBD parameter
//! catalogue implements [`ParameterSchema`].

use crate::error::Result;
use crate::params::schema::{ParamInfo, Section};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Execution Mode
// =============================================================================

/// Whether a command really runs or is simulated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Issue the real command and update observed state from its result
    Live,
    /// Dry-run the command; output is captured for a preview only
    Test,
}

impl ExecMode {
    pub fn is_test(self) -> bool {
        matches!(self, ExecMode::Test)
    }
}

impl std::fmt::Display for ExecMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecMode::Live => write!(f, "live"),
            ExecMode::Test => write!(f, "test"),
        }
    }
}

// =============================================================================
// DRBD Syntax
// =============================================================================

/// Configuration grammar generation understood by the target daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrbdSyntax {
    /// DRBD 8.3: no volumes, flag booleans, `after` in `syncer`
    Legacy,
    /// DRBD 8.4+: `volume` blocks, `yes`/`no` booleans, `resync-after`
    #[default]
    Modern,
}

impl DrbdSyntax {
    /// Whether resources are rendered with `volume <n> { }` blocks
    pub fn has_volumes(self) -> bool {
        matches!(self, DrbdSyntax::Modern)
    }

    /// Name of the sync ordering parameter in this grammar
    pub fn resync_after_param(self) -> &'static str {
        match self {
            DrbdSyntax::Legacy => "after",
            DrbdSyntax::Modern => "resync-after",
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

/// Operator commands the core knows how to issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DrbdCommand {
    Load,
    Attach,
    Detach,
    Connect,
    Disconnect,
    Up,
    Down,
    SetPrimary,
    SetSecondary,
    Invalidate,
    DiscardData,
    Resize,
    Verify,
    PauseSync,
    ResumeSync,
    SkipInitialFullSync,
    ProxyUp,
    ProxyDown,
    DelMinor,
    DelConnection,
    Adjust,
}

impl std::fmt::Display for DrbdCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DrbdCommand::Load => "load",
            DrbdCommand::Attach => "attach",
            DrbdCommand::Detach => "detach",
            DrbdCommand::Connect => "connect",
            DrbdCommand::Disconnect => "disconnect",
            DrbdCommand::Up => "up",
            DrbdCommand::Down => "down",
            DrbdCommand::SetPrimary => "set primary",
            DrbdCommand::SetSecondary => "set secondary",
            DrbdCommand::Invalidate => "invalidate",
            DrbdCommand::DiscardData => "discard data",
            DrbdCommand::Resize => "resize",
            DrbdCommand::Verify => "verify",
            DrbdCommand::PauseSync => "pause sync",
            DrbdCommand::ResumeSync => "resume sync",
            DrbdCommand::SkipInitialFullSync => "skip initial full sync",
            DrbdCommand::ProxyUp => "start proxy",
            DrbdCommand::ProxyDown => "stop proxy",
            DrbdCommand::DelMinor => "delete minor",
            DrbdCommand::DelConnection => "delete connection",
            DrbdCommand::Adjust => "adjust",
        };
        write!(f, "{}", name)
    }
}

/// A command addressed to one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Target host
    pub host: String,
    /// Command kind
    pub command: DrbdCommand,
    /// Resource the command applies to (absent for `load`)
    pub resource: Option<String>,
    /// Volume number, for per-volume commands
    pub volume: Option<u32>,
    /// Minor number, for `del-minor`
    pub minor: Option<u32>,
    /// Alternative configuration file (dry-run copies)
    pub config_file: Option<String>,
    /// Fully rendered shell command line
    pub line: String,
    /// Live or simulated
    pub mode: ExecMode,
}

/// Push rendered text to a path on a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    /// Target host
    pub host: String,
    /// Destination path
    pub path: String,
    /// File contents
    pub contents: String,
    /// Unix file mode
    pub file_mode: u32,
    /// Keep a backup of the previous file
    pub backup: bool,
    /// Shell hook run before the file is written
    pub pre_command: Option<String>,
    /// Shell hook run after the file is written
    pub post_command: Option<String>,
    /// Live or simulated
    pub mode: ExecMode,
}

/// Captured result of one executed command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Host the command ran on
    pub host: String,
    /// Command line or deploy description
    pub line: String,
    /// Process exit status
    pub exit_code: i32,
    /// Captured text output
    pub output: String,
    /// Mode the command ran in
    pub mode: ExecMode,
    /// Completion time
    pub finished_at: DateTime<Utc>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// =============================================================================
// Command Executor Port
// =============================================================================

/// Port for running commands on cluster hosts
///
/// Implementations must honour [`ExecMode::Test`] by dry-running: no device,
/// configuration file or process on the host may change.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a command on a host. A non-zero exit status is returned as
    /// `Ok` with the exit code set; an unreachable host is an `Err`.
    async fn execute(&self, request: &CommandRequest) -> Result<CommandOutput>;

    /// Write a file on a host
    async fn deploy(&self, request: &DeployRequest) -> Result<CommandOutput>;

    /// Raw DRBD status text (`/proc/drbd` format) of a host
    async fn fetch_status(&self, host: &str) -> Result<String>;
}

// =============================================================================
// Parameter Schema Port
// =============================================================================

/// Read-only catalogue of DRBD parameters
pub trait ParameterSchema: Send + Sync {
    /// Grammar generation this schema describes
    fn syntax(&self) -> DrbdSyntax;

    /// Look up a parameter by name
    fn param(&self, name: &str) -> Option<&ParamInfo>;

    /// Sections in declaration order
    fn sections(&self) -> &[Section];

    /// Parameters of a section in declaration order
    fn section_params(&self, section: &str) -> Vec<&ParamInfo>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type CommandExecutorRef = Arc<dyn CommandExecutor>;
pub type ParameterSchemaRef = Arc<dyn ParameterSchema>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_mode_display() {
        assert_eq!(format!("{}", ExecMode::Live), "live");
        assert_eq!(format!("{}", ExecMode::Test), "test");
        assert!(ExecMode::Test.is_test());
    }

    #[test]
    fn test_syntax_switches() {
        assert!(DrbdSyntax::Modern.has_volumes());
        assert!(!DrbdSyntax::Legacy.has_volumes());
        assert_eq!(DrbdSyntax::Legacy.resync_after_param(), "after");
        assert_eq!(DrbdSyntax::Modern.resync_after_param(), "resync-after");
    }
}
