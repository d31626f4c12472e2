//! IPC error types.

use thiserror::Error;

/// IPC error type.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Channel disconnected")]
    Disconnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Reply timeout")]
    Timeout,

    #[error("Protocol version mismatch: daemon reports {actual}, expected {expected}")]
    VersionMismatch { expected: i64, actual: i64 },
}

/// Result type for IPC operations.
pub type IpcResult<T> = Result<T, IpcError>;
