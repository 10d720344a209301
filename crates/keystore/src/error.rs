//! Error types for store operations

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store I/O error: {0}")]
    Io(String),

    #[error("store parse error: {0}")]
    Parse(String),

    #[error("key not found: {0}")]
    KeyNotFound(u64),

    #[error("duplicate key")]
    DuplicateKey,
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
