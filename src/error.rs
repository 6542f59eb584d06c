//! Error types for aegis-ratelimit.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Main error type for rate limiting operations.
#[derive(Error, Debug)]
pub enum AegisError {
    /// Configuration-related errors, raised at construction time
    #[error("Configuration error: {0}")]
    Config(String),

    /// `attempt` was called with a non-positive token count
    #[error("Invalid token count {0}: tokens must be positive")]
    InvalidTokens(u32),

    /// Rate limit keys must be non-empty
    #[error("Invalid key: rate limit keys must be non-empty")]
    EmptyKey,

    /// Storage backend I/O failure
    #[error("Storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file lock could not be acquired in time
    #[error("Timed out after {timeout:?} waiting for lock on {}", path.display())]
    LockTimeout { path: PathBuf, timeout: Duration },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AegisError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AegisError::Storage {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for aegis-ratelimit operations.
pub type Result<T> = std::result::Result<T, AegisError>;
