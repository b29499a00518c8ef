//! Errors surfaced by the pipe manager.
//!
//! Every variant that reaches the sink carries a stable code so the app can
//! branch on it without parsing messages.

use thiserror::Error;

/// Errors that can occur while opening or managing the accessory pipe
#[derive(Error, Debug)]
pub enum PipeError {
    /// The OS no longer grants access to the accessory
    #[error("permission denied for accessory")]
    PermissionDenied,
    /// The device disappeared or the handle is not a usable descriptor
    #[error("accessory unavailable: {0}")]
    DeviceUnavailable(String),
    /// Handle acquisition produced nothing usable
    #[error("failed to open accessory: {0}")]
    OpenFailed(String),
    /// The manager was shut down and accepts no further opens
    #[error("pipe manager is shut down")]
    ShutDown,
    /// Rejected configuration value
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for pipe operations
pub type PipeResult<T> = Result<T, PipeError>;

impl PipeError {
    /// Stable error code passed to `EventSink::on_error`
    pub fn code(&self) -> &'static str {
        match self {
            PipeError::PermissionDenied => "PERMISSION_DENIED",
            PipeError::DeviceUnavailable(_) => "DEVICE_UNAVAILABLE",
            PipeError::OpenFailed(_) => "OPEN_FAILED",
            PipeError::ShutDown => "SHUT_DOWN",
            PipeError::InvalidConfig(_) => "INVALID_CONFIG",
            PipeError::Io(_) => "IO_ERROR",
        }
    }
}
