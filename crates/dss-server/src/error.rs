//! Server error types.

use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Datastore error.
    #[error(transparent)]
    Datastore(#[from] dss_datastore::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Listener error.
    #[error("listener error: {0}")]
    Listener(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the service should back off and start again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Datastore(e) => e.is_retryable(),
            _ => false,
        }
    }
}
