//! Command execution: command lines, the live/test execution context and
//! dry-run sessions

pub mod commands;
pub mod context;
pub mod session;

pub use commands::*;
pub use context::*;
pub use session::*;
