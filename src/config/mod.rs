//! DRBD Configuration Text
//!
//! - [`render`]: model -> configuration text
//! - [`parse`]: configuration text -> syntax tree -> parameter maps
//! - [`escape`], [`writer`]: value quoting and indented output

pub mod escape;
pub mod parse;
pub mod render;
pub mod writer;

pub use escape::escape_config;
pub use parse::{import_parameters, import_resource, ConfigBlock, ConfigDocument, ConfigItem, ImportedResource};
pub use render::ConfigRenderer;
pub use writer::ConfigWriter;
