//! Device State
//!
//! - [`device`]: observed runtime attributes
//! - [`status`]: `/proc/drbd` parsing
//! - [`guards`]: which commands are legal in which state
//! - [`operations`]: guarded command execution

pub mod device;
pub mod guards;
pub mod operations;
pub mod status;

pub use device::{ConnectionState, DeviceStatus, DiskState, Role};
pub use guards::{available_commands, check, permitted, require, Denied};
pub use operations::{DeviceOperations, DeviceRef};
pub use status::StatusSnapshot;
