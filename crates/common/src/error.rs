//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the platform USB service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// Device or resource busy (e.g. not yet released after a previous close)
    #[error("device busy")]
    Busy,

    /// Device is gone
    #[error("no such device")]
    NoDevice,

    /// The caller does not hold permission for the device
    #[error("access denied")]
    Access,

    #[error("operation timed out")]
    Timeout,

    #[error("operation not supported by platform")]
    NotSupported,

    /// Notifications were requested before the platform was registered
    #[error("platform notifications not registered")]
    NotRegistered,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl PlatformError {
    /// Whether retrying the same operation shortly afterwards may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy | Self::Io(_) | Self::Timeout)
    }
}
