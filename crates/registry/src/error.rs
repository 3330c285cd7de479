//! Registry error types.

use thiserror::Error;

/// Errors raised while talking to control sources or the snapshot directory.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream {url} returned {status}: {body}")]
    Upstream {
        url: String,
        status: u16,
        body: String,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication error: {0}")]
    Auth(String),
}

/// Result type for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

impl From<waffle_core::Error> for RegistryError {
    fn from(err: waffle_core::Error) -> Self {
        Self::InvalidRow(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for RegistryError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Auth(err.to_string())
    }
}
