//! Error types for concierge-core

use thiserror::Error;

/// Result type alias using concierge-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the data model layer
#[derive(Error, Debug)]
pub enum Error {
    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A capability entry is malformed
    #[error("Invalid capability entry '{name}': {reason}")]
    InvalidCapability { name: String, reason: String },

    /// A capability name was registered twice
    #[error("Duplicate capability: {0}")]
    DuplicateCapability(String),
}

impl Error {
    /// Create an invalid-capability error
    pub fn invalid_capability(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCapability {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
