//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid slug: {0}")]
    InvalidSlug(String),

    #[error("invalid repository id: {0}")]
    InvalidRepoId(String),

    #[error("invalid branch name: {0}")]
    InvalidBranch(String),

    #[error("invalid access level: {0}")]
    InvalidAccessLevel(String),

    #[error("invalid access scope: {0}")]
    InvalidScope(String),

    #[error("invalid job id: {0}")]
    InvalidJobId(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
