//! Manager Configuration
//!
//! Deployment settings for the apply path and the allocator. Every field
//! has a default, so an empty YAML document is a valid configuration.

use crate::allocation::{PortAllocator, DEFAULT_DRBD_PORT, DEFAULT_PORT_CANDIDATES, DEFAULT_PROXY_PORT};
use crate::domain::ports::DrbdSyntax;
use crate::error::{Error, Result};
use crate::params::schema::{AccessLevel, DrbdSchema};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ManagerConfig {
    /// First replication port on an empty cluster
    pub default_port: u16,
    /// First proxy port on an empty relay
    pub default_proxy_port: u16,
    /// Directory holding the deployed configuration files
    pub config_dir: String,
    /// Top-level file including everything in `config_dir`
    pub main_config_file: String,
    /// File name for the `global`/`common` sections
    pub global_common_file: String,
    /// Suffix of per-resource files
    pub resource_suffix: String,
    /// Mode of deployed files
    pub file_mode: u32,
    /// Keep a backup of replaced files
    pub backup: bool,
    /// Appended to every path written by a preview
    pub dry_run_suffix: String,
    /// Grammar generation of the managed daemons
    pub syntax: DrbdSyntax,
    /// Operator privilege used to filter parameters
    pub access_level: AccessLevel,
    /// Free ports offered by `ports`
    pub port_candidates: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_DRBD_PORT,
            default_proxy_port: DEFAULT_PROXY_PORT,
            config_dir: "/etc/drbd.d".to_string(),
            main_config_file: "/etc/drbd.conf".to_string(),
            global_common_file: "global_common.conf".to_string(),
            resource_suffix: ".res".to_string(),
            file_mode: 0o600,
            backup: true,
            dry_run_suffix: ".dry".to_string(),
            syntax: DrbdSyntax::Modern,
            access_level: AccessLevel::Admin,
            port_candidates: DEFAULT_PORT_CANDIDATES,
        }
    }
}

impl ManagerConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&text)?;
        info!("Loaded manager configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_port == 0 || self.default_proxy_port == 0 {
            return Err(Error::Configuration("default ports must be non-zero".into()));
        }
        if self.dry_run_suffix.is_empty() {
            return Err(Error::Configuration(
                "dry_run_suffix must not be empty; previews would overwrite live files".into(),
            ));
        }
        if self.resource_suffix.is_empty() || self.global_common_file.is_empty() {
            return Err(Error::Configuration("file names must not be empty".into()));
        }
        if self.file_mode > 0o7777 {
            return Err(Error::Configuration(format!("invalid file mode {:o}", self.file_mode)));
        }
        Ok(())
    }

    pub fn allocator(&self) -> PortAllocator {
        PortAllocator::new(self.default_port, self.default_proxy_port, self.port_candidates)
    }

    pub fn schema(&self) -> DrbdSchema {
        DrbdSchema::builtin(self.syntax)
    }

    pub fn global_common_path(&self) -> String {
        format!("{}/{}", self.config_dir.trim_end_matches('/'), self.global_common_file)
    }

    pub fn resource_path(&self, resource: &str) -> String {
        format!(
            "{}/{}{}",
            self.config_dir.trim_end_matches('/'),
            resource,
            self.resource_suffix
        )
    }

    /// Where a file lands for the given mode
    pub fn target_path(&self, path: &str, test: bool) -> String {
        if test {
            format!("{}{}", path, self.dry_run_suffix)
        } else {
            path.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.default_port, 7788);
        assert_eq!(config.global_common_path(), "/etc/drbd.d/global_common.conf");
        assert_eq!(config.resource_path("r0"), "/etc/drbd.d/r0.res");
        assert_eq!(config.target_path("/etc/drbd.d/r0.res", true), "/etc/drbd.d/r0.res.dry");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml() {
        let config = ManagerConfig::from_yaml("syntax: legacy\nconfig_dir: /tmp/drbd/\n").unwrap();
        assert_eq!(config.syntax, DrbdSyntax::Legacy);
        assert_eq!(config.resource_path("r0"), "/tmp/drbd/r0.res");
        assert_eq!(config.file_mode, 0o600);

        assert_matches!(
            ManagerConfig::from_yaml("dry_run_suffix: ''\n"),
            Err(Error::Configuration(_))
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_port: 7900\naccess_level: operator").unwrap();
        let config = ManagerConfig::load(file.path()).unwrap();
        assert_eq!(config.default_port, 7900);
        assert_eq!(config.access_level, AccessLevel::Operator);
        assert_eq!(config.allocator().lowest_unused_port(&Default::default(), &[]).unwrap(), 7900);
    }
}
