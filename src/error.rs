//! Error taxonomy for the storage layer.
//!
//! Every failure the core can surface maps to one variant here. The router
//! wraps adapter failures in [`Error::Backend`] so callers always know which
//! backend failed; [`Error::root`] strips that annotation again.

use crate::storage::BackendId;
use thiserror::Error;

/// Result type for storage layer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Envelope authentication failed (tampered data, corrupted row, or wrong key).
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// The provider rejected the refresh token. Terminal until re-consent.
    #[error("credential '{credential_id}' was rejected by the provider; reconnect required")]
    AuthExpired { credential_id: String },

    #[error("credential '{0}' not found")]
    CredentialNotFound(String),

    /// Network or 5xx-class failure; safe for the caller to retry with backoff.
    #[error("transient backend failure: {0}")]
    TransientBackend(String),

    /// The backend rejected the access token at use time.
    #[error("authorization rejected by backend")]
    Unauthorized,

    /// The backend refused the request for a reason retrying will not fix.
    #[error("request refused by backend (status {status}): {message}")]
    BackendRejected { status: u16, message: String },

    #[error("input exceeds the {limit} byte spool cap and declared no size")]
    ClassificationInput { limit: u64 },

    #[error("object of {size} bytes exceeds the {limit} byte per-object limit")]
    ObjectTooLarge { size: u64, limit: u64 },

    #[error("object '{0}' not found")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An adapter failure annotated with the backend that produced it.
    #[error("{backend} backend: {source}")]
    Backend {
        backend: BackendId,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Annotates this error with the backend that produced it.
    ///
    /// Already-annotated errors are returned unchanged.
    pub fn in_backend(self, backend: BackendId) -> Self {
        match self {
            Error::Backend { .. } => self,
            other => Error::Backend {
                backend,
                source: Box::new(other),
            },
        }
    }

    /// The underlying error with any backend annotation removed.
    pub fn root(&self) -> &Error {
        match self {
            Error::Backend { source, .. } => source.root(),
            other => other,
        }
    }

    /// The backend this error was annotated with, if any.
    pub fn backend(&self) -> Option<BackendId> {
        match self {
            Error::Backend { backend, .. } => Some(*backend),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::TransientBackend(e.to_string())
    }
}
