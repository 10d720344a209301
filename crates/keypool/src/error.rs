//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key not found: {0}")]
    NotFound(u64),

    #[error("store error: {0}")]
    Store(#[from] keystore::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
