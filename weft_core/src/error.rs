//! Unified error handling for weft
//!
//! This module provides the central error type shared by all weft
//! components. Modules with a distinct failure domain (trace parsing,
//! replay) define their own error enums and convert into `WeftError`
//! at the crate boundary.

use thiserror::Error;

/// Main error type for weft operations
#[derive(Debug, Error)]
pub enum WeftError {
    /// I/O related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Trace file parsing errors
    #[error("Parse error: {0}")]
    Parse(#[from] crate::trace::io::ParseError),

    /// Trace model contract violations (per-routine order, unknown events)
    #[error("Trace error: {0}")]
    Trace(String),

    /// Analysis errors
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// Trace rewriting errors
    #[error("Rewrite error: {0}")]
    Rewrite(String),

    /// Replay manager errors
    #[error("Replay error: {0}")]
    Replay(String),

    /// Fuzzing campaign errors
    #[error("Fuzzing error: {0}")]
    Fuzzing(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/Deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Resource not found errors
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid input/argument errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic internal errors (use sparingly)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using WeftError
pub type WeftResult<T> = Result<T, WeftError>;

impl From<serde_json::Error> for WeftError {
    fn from(err: serde_json::Error) -> Self {
        WeftError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for WeftError {
    fn from(err: bincode::Error) -> Self {
        WeftError::Serialization(err.to_string())
    }
}

impl From<std::num::ParseIntError> for WeftError {
    fn from(err: std::num::ParseIntError) -> Self {
        WeftError::InvalidInput(format!("Integer parse error: {}", err))
    }
}

// Helper methods
impl WeftError {
    /// Create a trace model error
    pub fn trace<S: Into<String>>(msg: S) -> Self {
        WeftError::Trace(msg.into())
    }

    /// Create an analysis error
    pub fn analysis<S: Into<String>>(msg: S) -> Self {
        WeftError::Analysis(msg.into())
    }

    /// Create a rewrite error
    pub fn rewrite<S: Into<String>>(msg: S) -> Self {
        WeftError::Rewrite(msg.into())
    }

    /// Create a replay error
    pub fn replay<S: Into<String>>(msg: S) -> Self {
        WeftError::Replay(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        WeftError::NotFound(resource.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        WeftError::InvalidInput(msg.into())
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, WeftError::Timeout(_))
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, WeftError::NotFound(_))
    }
}
