//! DRBD Parameters
//!
//! - [`schema`]: static parameter catalogue
//! - [`resolver`]: layered value lookup and resync-after references
//! - [`validation`]: value and resource checks

pub mod resolver;
pub mod schema;
pub mod validation;

pub use resolver::{
    persisted_resync_cycles, resync_after_candidates, Layer, LayerKind, ParamResolver, Resolved,
    ScopeChain,
};
pub use schema::{AccessLevel, DrbdSchema, ParamInfo, ParamKind, Section, UnitSpec};
pub use validation::{check_common, check_param, check_resource};
