//! Error types for vnetd
//!
//! [`SettingError`] is what a caller of `apply` sees. [`PlatformError`] and
//! [`SinkError`] come from the two external collaborators, and
//! [`VnetdError`] wraps everything the daemon itself can fail on.

use thiserror::Error;

/// Failure reported by the hardware layer while applying a change.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    /// The interface rejected the requested value.
    #[error("{interface}: {message}")]
    Rejected {
        /// Interface name.
        interface: String,
        /// Reason given by the hardware layer.
        message: String,
    },

    /// The interface does not support the requested operation.
    #[error("{interface}: {operation} not supported")]
    Unsupported {
        /// Interface name.
        interface: String,
        /// Operation that was attempted (e.g. "fec").
        operation: String,
    },
}

impl PlatformError {
    /// Creates a rejection error.
    pub fn rejected(interface: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            interface: interface.into(),
            message: message.into(),
        }
    }

    /// Creates an unsupported-operation error.
    pub fn unsupported(interface: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            interface: interface.into(),
            operation: operation.into(),
        }
    }
}

/// Outcome of a rejected `apply` call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SettingError {
    /// Value malformed or out of range; nothing was changed.
    #[error("{key}: {message}")]
    Validation {
        /// Setting key.
        key: String,
        /// Why the value was rejected.
        message: String,
    },

    /// Key matched no recognized setting.
    #[error("unknown setting: can't set {key} to {value}")]
    UnknownSetting {
        /// Setting key.
        key: String,
        /// Requested value.
        value: String,
    },

    /// Key named an interface the platform does not know.
    #[error("unknown interface: {0}")]
    UnknownInterface(String),

    /// The hardware layer refused the change.
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    /// The scheduler is gone (daemon shutting down).
    #[error("scheduler unavailable")]
    Unavailable,
}

impl SettingError {
    /// Creates a validation error.
    pub fn validation(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates an unknown-setting error.
    pub fn unknown(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::UnknownSetting {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Failure talking to a downstream sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Redis connection or command failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Record could not be interpreted by the sink.
    #[error("malformed record: {0}")]
    Malformed(String),
}

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum VnetdError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Sink error
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Setting error surfaced at daemon level
    #[error("Setting error: {0}")]
    Setting(#[from] SettingError),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Background task failed to join
    #[error("Task error: {0}")]
    Task(String),
}

/// Result type for vnetd operations
pub type Result<T> = std::result::Result<T, VnetdError>;
