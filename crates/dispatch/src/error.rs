//! Errors surfaced to dispatch callers

use keypool::ErrorKind;

/// Terminal failure of one dispatched call.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The eligible key set was empty. Not retried: without a key change
    /// a retry would spin on the same answer.
    #[error("no api keys available")]
    NoAvailableKeys,

    #[error("retries exhausted after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    /// A non-retryable upstream failure, with the classifier's verdict.
    #[error("{message}")]
    Upstream { kind: ErrorKind, message: String },

    #[error("engine is shutting down")]
    Shutdown,

    #[error(transparent)]
    Pool(#[from] keypool::Error),
}

impl Error {
    /// Stable label for metrics and audit records.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoAvailableKeys => "no_keys",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Upstream { kind, .. } => kind.label(),
            Self::Shutdown => "shutdown",
            Self::Pool(_) => "pool",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
