//! Error types for gamehost.

use thiserror::Error;

/// Common error type for gamehost.
#[derive(Error, Debug)]
pub enum HostError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Script execution error.
    ///
    /// Raised for errors that escape a sandboxed script, including module
    /// load cycles surfaced through `require`.
    #[error("script error: {0}")]
    Script(String),

    /// A value that cannot be represented in the persistence format.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A persisted document carries a version this build does not understand.
    #[error("unsupported document version: expected {expected}, found {found}")]
    VersionMismatch {
        /// The version this build reads and writes.
        expected: u64,
        /// The version found in the document (rendered as text).
        found: String,
    },

    /// Background resource acquisition failed.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Malformed or missing game package.
    #[error("package error: {0}")]
    Package(String),

    /// Validation error for caller input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<mlua::Error> for HostError {
    fn from(e: mlua::Error) -> Self {
        HostError::Script(e.to_string())
    }
}

/// Result type alias for gamehost operations.
pub type Result<T> = std::result::Result<T, HostError>;
