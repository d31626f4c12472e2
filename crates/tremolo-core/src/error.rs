//! Error types for Tremolo core.

use thiserror::Error;

/// Core error type for Tremolo operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown {kind} ordinal: {value}")]
    UnknownOrdinal { kind: &'static str, value: i64 },
}

/// Result type alias for Tremolo core operations.
pub type Result<T> = std::result::Result<T, Error>;
