//! Unified error handling for thermctl
//!
//! This crate provides a single error type used across all thermctl components.
//! It uses thiserror for ergonomic error definitions with proper Display and Error trait impls.
//!
//! Every variant belongs to one [`ErrorKind`] so that callers on the far side of the
//! daemon socket can decide whether a retry makes sense without parsing messages.

use std::io;
use std::path::PathBuf;

/// Result type alias using ThermalError
pub type Result<T> = std::result::Result<T, ThermalError>;

/// Coarse classification of a [`ThermalError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller-correctable input problem, never retried automatically
    Validation,
    /// Referenced fan, sensor or alert does not exist
    NotFound,
    /// Hardware did not do what it was told
    Actuation,
    /// History store read/write failure
    Storage,
    /// Rejected configuration
    Configuration,
    /// Operation abandoned after its deadline
    Timeout,
    /// Anything else (I/O, IPC plumbing)
    Internal,
}

impl ErrorKind {
    /// Stable wire name (snake_case)
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Actuation => "actuation",
            ErrorKind::Storage => "storage",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for all thermctl operations
#[derive(thiserror::Error, Debug)]
pub enum ThermalError {
    // ============================================================================
    // Validation Errors
    // ============================================================================
    #[error("{field} out of range: {value} (must be {min}-{max})")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Invalid identifier '{id}': {reason}")]
    InvalidIdentifier {
        id: String,
        reason: String,
    },

    #[error("Invalid {field} '{value}': expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Invalid transition for alert {alert_id}: cannot {action} an alert that is {from}")]
    InvalidTransition {
        alert_id: String,
        from: String,
        action: String,
    },

    #[error("Fan {fan_id} is under manual control")]
    ManualOverride {
        fan_id: String,
    },

    // ============================================================================
    // Lookup Errors
    // ============================================================================
    #[error("Fan not found: {0}")]
    FanNotFound(String),

    #[error("Sensor not found: {0}")]
    SensorNotFound(String),

    #[error("Alert not found: {0}")]
    AlertNotFound(String),

    // ============================================================================
    // Actuation Errors
    // ============================================================================
    #[error("Actuation failed for fan {fan_id}: {reason}")]
    Actuator {
        fan_id: String,
        reason: String,
    },

    #[error("Fan {fan_id} speed mismatch: expected ~{expected_rpm} RPM, observed {observed_rpm} RPM")]
    SpeedMismatch {
        fan_id: String,
        expected_rpm: u32,
        observed_rpm: u32,
    },

    // ============================================================================
    // Storage Errors
    // ============================================================================
    #[error("History store error: {0}")]
    Store(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("File too large: {path} ({size} bytes, max {max_size} bytes)")]
    FileTooLarge {
        path: PathBuf,
        size: u64,
        max_size: u64,
    },

    // ============================================================================
    // I/O and IPC Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Daemon connection failed: {0}")]
    DaemonConnection(String),

    #[error("Daemon response error: {0}")]
    DaemonResponse(String),

    #[error("IPC protocol error: {0}")]
    IpcProtocol(String),

    #[error("Message too large: {size} bytes (max {max_size} bytes)")]
    MessageTooLarge {
        size: usize,
        max_size: usize,
    },

    #[error("{0}")]
    Generic(String),
}

impl ThermalError {
    /// Classify this error for callers that decide on retry
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfRange { .. }
            | Self::InvalidIdentifier { .. }
            | Self::InvalidValue { .. }
            | Self::InvalidTransition { .. }
            | Self::ManualOverride { .. } => ErrorKind::Validation,

            Self::FanNotFound(_) | Self::SensorNotFound(_) | Self::AlertNotFound(_) => {
                ErrorKind::NotFound
            }

            Self::Actuator { .. } | Self::SpeedMismatch { .. } => ErrorKind::Actuation,

            Self::Store(_) => ErrorKind::Storage,

            Self::InvalidConfig { .. }
            | Self::MissingConfig(_)
            | Self::JsonParse(_)
            | Self::FileTooLarge { .. } => ErrorKind::Configuration,

            Self::Timeout(_) => ErrorKind::Timeout,

            Self::Io(_)
            | Self::FileRead { .. }
            | Self::FileWrite { .. }
            | Self::DaemonConnection(_)
            | Self::DaemonResponse(_)
            | Self::IpcProtocol(_)
            | Self::MessageTooLarge { .. }
            | Self::Generic(_) => ErrorKind::Internal,
        }
    }

    /// Create an out-of-range error
    pub fn out_of_range(field: impl Into<String>, value: f64, min: f64, max: f64) -> Self {
        Self::OutOfRange {
            field: field.into(),
            value,
            min,
            max,
        }
    }

    /// Create an invalid identifier error
    pub fn invalid_id(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create an error for a value outside a fixed set of choices
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an actuator error
    pub fn actuator(fan_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Actuator {
            fan_id: fan_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a store error from a string
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }
}

impl From<String> for ThermalError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

impl From<&str> for ThermalError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
