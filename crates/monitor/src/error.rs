//! Session monitor error types

use common::PlatformError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    /// The monitor was destroyed; the instance is permanently unusable
    #[error("session monitor already destroyed")]
    AlreadyDestroyed,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied for {device}")]
    PermissionDenied { device: String },

    /// Native open kept failing, or failed with a non-transient error
    #[error("failed to open {device} after {attempts} attempt(s): {source}")]
    OpenFailed {
        device: String,
        attempts: u32,
        #[source]
        source: PlatformError,
    },

    /// Operation on a control block that was already closed
    #[error("control block already closed")]
    AlreadyClosed,

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("worker unavailable: {0}")]
    Worker(String),

    #[error("install state error: {0}")]
    InstallState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
