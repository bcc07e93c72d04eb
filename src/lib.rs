//! DRBD Manager - Configuration and Orchestration Layer
//!
//! Models replicated block-storage resources across a cluster of hosts,
//! renders them into DRBD configuration text, allocates replication and
//! proxy ports, and gates operator commands on observed device state.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                      Apply Coordinator                            │
//! │        validate → render → deploy → adjust → re-derive            │
//! ├───────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────────┐ │
//! │  │  Parameter   │  │ Config Text  │  │   Port / Address         │ │
//! │  │  Resolution  │  │ Render/Parse │  │   Allocator              │ │
//! │  └──────┬───────┘  └──────┬───────┘  └────────────┬─────────────┘ │
//! │         └─────────────────┼───────────────────────┘               │
//! │                  ┌────────┴─────────┐                             │
//! │                  │   Domain Model   │                             │
//! │                  │ (SharedCluster)  │                             │
//! │                  └────────┬─────────┘                             │
//! ├───────────────────────────┼───────────────────────────────────────┤
//! │   Device State Machine    │      Execution Context (LIVE/TEST)    │
//! │   guards + operations     │      dry-run sessions                 │
//! └───────────────────────────┴───────────────────────────────────────┘
//!                             │
//!                   CommandExecutor (remote hosts)
//! ```
//!
//! # Modules
//!
//! - [`model`]: hosts, block devices, resources, volumes, proxy links
//! - [`params`]: parameter schema, layered resolution, validation
//! - [`config`]: configuration text rendering and parsing
//! - [`allocation`]: port and proxy port allocation
//! - [`state`]: observed device state, command guards, device operations
//! - [`exec`]: command lines, execution context, dry-run sessions
//! - [`controlplane`]: manager configuration and the apply coordinator
//! - [`domain`]: ports to external collaborators
//! - [`error`]: error types and handling

pub mod allocation;
pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod exec;
pub mod model;
pub mod params;
pub mod state;

// Re-export commonly used types
pub use allocation::{PortAllocator, ProxyPortPair};

pub use config::{ConfigDocument, ConfigRenderer};

pub use controlplane::{ApplyCoordinator, ApplyReport, CoordinatorStatus, ManagerConfig, RenderedFile};

pub use domain::ports::{
    CommandExecutor, CommandExecutorRef, CommandOutput, CommandRequest, DeployRequest,
    DrbdCommand, DrbdSyntax, ExecMode, ParameterSchema, ParameterSchemaRef,
};

pub use error::{Error, ErrorCategory, Result, ValidationErrors};

pub use exec::{CommandBuilder, DryRunReport, DryRunSession, ExecContext};

pub use model::{
    BindVolume, BlockDevice, Cluster, Host, MetaDisk, MetaDiskIndex, ProxyLink, Resource,
    SharedCluster, Volume,
};

pub use params::{DrbdSchema, ParamResolver, ScopeChain};

pub use state::{DeviceOperations, DeviceRef, DeviceStatus, StatusSnapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
