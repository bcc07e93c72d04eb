//! Error types for the DRBD manager
//!
//! Provides structured error types for every layer of the manager: the
//! domain model, parameter resolution, configuration rendering, port
//! allocation, device commands and dry-run sessions.

use std::fmt;
use thiserror::Error;

/// Unified error type for the manager
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Domain Model Errors
    // =========================================================================
    #[error("Host not found: {host}")]
    HostNotFound { host: String },

    #[error("Host already exists: {host}")]
    HostExists { host: String },

    #[error("Resource not found: {resource}")]
    ResourceNotFound { resource: String },

    #[error("Resource already exists: {resource}")]
    ResourceExists { resource: String },

    #[error("Resource {resource} is committed and cannot be renamed")]
    ResourceCommitted { resource: String },

    #[error("Volume not found: {resource}/{volume}")]
    VolumeNotFound { resource: String, volume: u32 },

    #[error("Volume already exists: {resource}/{volume}")]
    VolumeExists { resource: String, volume: u32 },

    #[error("Block device not found: {host}:{device}")]
    BlockDeviceNotFound { host: String, device: String },

    #[error("Block device {host}:{device} is already used by {resource}")]
    BlockDeviceInUse {
        host: String,
        device: String,
        resource: String,
    },

    #[error("Device path {device} is already used by {resource}/{volume}")]
    DuplicateDevicePath {
        device: String,
        resource: String,
        volume: u32,
    },

    #[error("Host {host} is not part of resource {resource}")]
    HostNotInResource { resource: String, host: String },

    // =========================================================================
    // Parameter Errors
    // =========================================================================
    #[error("Unknown parameter: {name}")]
    ParameterNotFound { name: String },

    #[error("Invalid value {value:?} for {param}: {reason}")]
    InvalidParameter {
        param: String,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Validation(ValidationErrors),

    #[error("resync-after of {resource} cannot point to {target}: the chain leads back to {resource}")]
    CyclicResyncAfter { resource: String, target: String },

    // =========================================================================
    // Rendering Errors
    // =========================================================================
    #[error("DRBD configuration incomplete: resource {resource} on host {host}: {missing} is not set")]
    ConfigurationIncomplete {
        resource: String,
        host: String,
        missing: String,
    },

    // =========================================================================
    // Allocation Errors
    // =========================================================================
    #[error("Port {port} is already used on host {host}")]
    DuplicatePort { host: String, port: u16 },

    #[error("Port range exhausted for hosts {hosts}")]
    PortsExhausted { hosts: String },

    // =========================================================================
    // Command Errors
    // =========================================================================
    #[error("Cannot {command} {device}: {reason}")]
    CommandNotPermitted {
        command: String,
        device: String,
        reason: String,
    },

    #[error("Command {command} failed on {host} (exit {exit_code}): {output}")]
    CommandFailed {
        host: String,
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("Host unreachable: {host}")]
    HostUnreachable { host: String },

    // =========================================================================
    // Dry-Run Errors
    // =========================================================================
    #[error("Dry-run session was cancelled")]
    DryRunCancelled,

    #[error("Operation requires a dry-run session but none was supplied")]
    DryRunSessionMissing,

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Config parse error at line {line}: {reason}")]
    ConfigParse { line: usize, reason: String },

    #[error("Status parse error: {0}")]
    StatusParse(String),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Validation Error Collection
// =============================================================================

/// A single field-level validation problem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Where the field lives, e.g. `r0`, `r0/0`, `common`, `alpha:/dev/sdb`
    pub scope: String,
    /// Parameter name
    pub param: String,
    /// Offending value
    pub value: String,
    /// Human readable reason
    pub reason: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} = {:?}: {}",
            self.scope, self.param, self.value, self.reason
        )
    }
}

/// All validation problems found in one checking pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        scope: impl Into<String>,
        param: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) {
        self.0.push(FieldError {
            scope: scope.into(),
            param: param.into(),
            value: value.into(),
            reason: reason.into(),
        });
    }

    pub fn extend(&mut self, other: ValidationErrors) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.0.iter()
    }

    /// Turn the collection into `Ok(())` or `Err(Error::Validation)`
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation error(s)", self.0.len())?;
        for err in &self.0 {
            write!(f, "\n  {}", err)?;
        }
        Ok(())
    }
}

// =============================================================================
// Error Category
// =============================================================================

/// Coarse classification used by callers to decide how to surface an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A required field is unset; rendering for that resource/host aborted
    Incomplete,
    /// A value failed its type/range/uniqueness check
    Validation,
    /// The command executor reported a failure
    External,
    /// A resync-after chain would reach back to itself
    Cyclic,
    /// Anything else
    Internal,
}

impl Error {
    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::ConfigurationIncomplete { .. } => ErrorCategory::Incomplete,

            Error::InvalidParameter { .. }
            | Error::Validation(_)
            | Error::ParameterNotFound { .. }
            | Error::DuplicateDevicePath { .. }
            | Error::DuplicatePort { .. }
            | Error::ResourceExists { .. }
            | Error::VolumeExists { .. }
            | Error::HostExists { .. }
            | Error::BlockDeviceInUse { .. }
            | Error::ResourceCommitted { .. }
            | Error::CommandNotPermitted { .. } => ErrorCategory::Validation,

            Error::CommandFailed { .. } | Error::HostUnreachable { .. } => {
                ErrorCategory::External
            }

            Error::CyclicResyncAfter { .. } => ErrorCategory::Cyclic,

            _ => ErrorCategory::Internal,
        }
    }

    /// Whether an operator may sensibly retry the same request.
    ///
    /// Nothing in this crate retries automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::External)
    }
}

/// Result type alias for the manager
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err = Error::ConfigurationIncomplete {
            resource: "r0".into(),
            host: "alpha".into(),
            missing: "device".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Incomplete);
        assert!(err.to_string().contains("DRBD configuration incomplete"));
        assert!(err.to_string().contains("r0"));
        assert!(err.to_string().contains("alpha"));

        let err = Error::CyclicResyncAfter {
            resource: "r0".into(),
            target: "r1".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Cyclic);

        let err = Error::DuplicatePort {
            host: "alpha".into(),
            port: 7788,
        };
        assert_eq!(err.category(), ErrorCategory::Validation);
    }

    #[test]
    fn test_error_retryable() {
        let external = Error::CommandFailed {
            host: "alpha".into(),
            command: "attach".into(),
            exit_code: 10,
            output: "no such device".into(),
        };
        assert!(external.is_retryable());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
    }

    #[test]
    fn test_validation_errors_collect() {
        let mut errors = ValidationErrors::new();
        assert!(errors.clone().into_result().is_ok());

        errors.push("r0", "timeout", "abc", "not a number");
        errors.push("r0/0", "DrbdDevice", "/dev/sda", "must be /dev/drbdN");
        assert_eq!(errors.len(), 2);

        let text = errors.to_string();
        assert!(text.starts_with("2 validation error(s)"));
        assert!(text.contains("timeout"));
        assert!(text.contains("DrbdDevice"));

        match errors.into_result() {
            Err(Error::Validation(all)) => assert_eq!(all.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }
}
