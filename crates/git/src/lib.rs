//! Git working copies for the waffle dataset gateway.
//!
//! This crate provides:
//! - The `GitBackend` abstraction and a backend driving the system `git`
//! - The on-disk dataset layout and eviction of unlisted directories
//! - The single-concurrency git worker with retry and backoff

pub mod backends;
pub mod error;
pub mod layout;
pub mod traits;
pub mod worker;

pub use backends::cli::CliGit;
pub use error::{GitError, GitResult};
pub use layout::DatasetLayout;
pub use traits::{GitBackend, GitJobSpec, ProgressFn, no_progress, run_job};
pub use worker::{JobSnapshot, WorkerConfig, WorkerHandle};
