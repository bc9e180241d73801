//! Error types for the guestbox runtime.

use thiserror::Error;

/// Message reported when the guest runtime image could not be loaded.
pub const RUNTIME_UNAVAILABLE: &str = "Load python.wasm file failed";

/// Errors that end a launch before the guest reports an exit code.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The runtime image fetch failed earlier in this process.
    #[error("{}", RUNTIME_UNAVAILABLE)]
    RuntimeUnavailable,

    /// The isolated execution context could not be created.
    #[error("failed to start execution context: {0}")]
    ContextStartFailed(String),

    /// The context never sent its readiness signal, or sent something else.
    #[error("handshake with execution context failed: {0}")]
    HandshakeFailed(String),

    /// The control channel closed while a request was outstanding.
    #[error("control channel closed")]
    ChannelClosed,

    /// The context answered a request with a failure.
    #[error("guest execution failed: {0}")]
    ExecutionFailed(String),
}

impl LaunchError {
    /// The failure kind recorded in the launcher's terminal state.
    pub fn kind(&self) -> FailureKind {
        match self {
            LaunchError::RuntimeUnavailable => FailureKind::RuntimeUnavailable,
            LaunchError::ContextStartFailed(_) => FailureKind::ContextStartFailed,
            LaunchError::HandshakeFailed(_) => FailureKind::HandshakeFailed,
            LaunchError::ChannelClosed | LaunchError::ExecutionFailed(_) => {
                FailureKind::ExecutionFailed
            }
        }
    }
}

/// Coarse classification of a failed launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RuntimeUnavailable,
    ContextStartFailed,
    HandshakeFailed,
    ExecutionFailed,
}

/// Errors returned by host services across the sync I/O bridge.
///
/// These reach the guest through its normal I/O error channel and never
/// abort a launch on their own.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("io error: {0}")]
    Io(String),

    /// The bridge was torn down before the call was answered.
    #[error("service connection closed")]
    Closed,
}

impl From<std::io::Error> for ServiceError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::NotFound => ServiceError::NotFound(error.to_string()),
            ErrorKind::PermissionDenied => ServiceError::PermissionDenied(error.to_string()),
            _ => ServiceError::Io(error.to_string()),
        }
    }
}

/// Errors raised by a guest engine while running an image.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to compile guest image: {0}")]
    Compile(String),

    #[error("failed to link guest imports: {0}")]
    Link(String),

    #[error("guest trapped: {0}")]
    Trap(String),

    /// The context was terminated while the guest was running.
    #[error("guest interrupted")]
    Interrupted,

    #[error("guest memory access out of bounds")]
    Memory,
}

/// Result type alias for launcher operations.
pub type Result<T> = std::result::Result<T, LaunchError>;
