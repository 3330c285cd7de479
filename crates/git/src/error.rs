//! Git error types.

use std::time::Duration;
use thiserror::Error;

/// Git operation errors.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git is not available on PATH")]
    GitNotAvailable,

    #[error("git {command} failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("credentials error: {0}")]
    Credentials(String),

    #[error("git worker is unavailable")]
    WorkerUnavailable,

    #[error("job {job} did not finish within {waited:?}")]
    PollTimeout { job: String, waited: Duration },

    #[error("job {job} failed: {error}")]
    JobFailed { job: String, error: String },

    #[error("job {0} is unknown to the worker")]
    UnknownJob(String),
}

/// Result type for git operations.
pub type GitResult<T> = std::result::Result<T, GitError>;
