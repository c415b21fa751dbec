//! AFF4 error types

use thiserror::Error;

/// The main error type for AFF4 operations
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from the backing store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No handler or member for a URN, or an unresolved reference
    #[error("Not found: {0}")]
    NotFound(String),

    /// Structural mismatch in an on-disk format
    #[error("Format error: {0}")]
    Format(String),

    /// A stored digest did not match the computed one
    #[error("Integrity failure: {0}")]
    Integrity(String),

    /// API misuse; callers must not attempt to recover from this
    #[error("Programmer error: {0}")]
    Programmer(String),

    /// Cancellation observed at a progress-report point
    #[error("Aborted")]
    Aborted,
}

/// Result type alias for AFF4 operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a format error
    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    /// Create an integrity failure
    pub fn integrity(msg: impl Into<String>) -> Self {
        Error::Integrity(msg.into())
    }

    /// Create a programmer error
    pub fn programmer(msg: impl Into<String>) -> Self {
        Error::Programmer(msg.into())
    }
}
