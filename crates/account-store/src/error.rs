//! Error types for account store operations

/// Errors from reading or writing the pool document.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
