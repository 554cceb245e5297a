//! Error taxonomy shared by the driver facade and the engine.

use thiserror::Error;

/// Errors surfaced by driver and engine operations.
///
/// The four user-visible categories are `NotFound`, `InvalidParameter`,
/// `InvalidOperation` and `OperationFailed`. `Unsupported` is kept as a
/// distinct variant so callers can tolerate drivers that lack an optional
/// feature (snapshot listing during delete); clients see it rendered as an
/// invalid operation.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Referenced VM/volume/pool/device/snapshot does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Malformed or contextually illegal input.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Legal input, illegal state transition.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The underlying driver does not support the operation.
    #[error("operation not supported by driver: {0}")]
    Unsupported(String),

    /// Underlying driver or host tool call failed.
    #[error("{op} failed: {cause}")]
    OperationFailed { op: &'static str, cause: String },
}

impl EngineError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound { kind, name: name.into() }
    }

    pub fn failed(op: &'static str, cause: impl std::fmt::Display) -> Self {
        Self::OperationFailed { op, cause: cause.to_string() }
    }

    /// Stable error code for the REST layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidParameter(_) => "invalid_parameter",
            Self::InvalidOperation(_) | Self::Unsupported(_) => "invalid_operation",
            Self::OperationFailed { .. } => "operation_failed",
        }
    }
}

/// Result type alias for driver and engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
