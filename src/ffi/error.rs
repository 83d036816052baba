//! FFI Errors
//!
//! Every failure the engine can surface to a caller.

use thiserror::Error;

use crate::config::ConfigError;

/// Error type for FFI operations
#[derive(Debug, Error)]
pub enum FfiError {
    /// Resolution or dependency lookup failed
    #[error("Library not found: {name} ({reason})")]
    MissingLibrary { name: String, reason: String },

    /// Symbol absent in a loaded library, or function never declared
    #[error("Function not found: {library}:{function}")]
    MissingFunction { library: String, function: String },

    /// The native loader rejected a resolved file
    #[error("Failed to load library '{path}': {reason}")]
    LibraryLoadFailure { path: String, reason: String },

    /// Argument count does not match the declared parameter count
    #[error("Invalid argument count for '{function}': expected {expected}, got {got}")]
    ArityMismatch {
        function: String,
        expected: usize,
        got: usize,
    },

    /// Value shape inconsistent with its descriptor
    #[error("Marshaling failed: {0}")]
    MarshalingFailure(String),

    /// Host platform not recognized
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Host architecture not recognized
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// I/O failure while acquiring library bytes
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid binding configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl FfiError {
    pub(crate) fn missing_library(name: impl Into<String>, reason: impl Into<String>) -> Self {
        FfiError::MissingLibrary {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn marshal(msg: impl Into<String>) -> Self {
        FfiError::MarshalingFailure(msg.into())
    }
}

/// Result type for FFI operations.
pub type FfiResult<T> = Result<T, FfiError>;
