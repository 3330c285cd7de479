//! External collaborators of the waffle dataset gateway.
//!
//! This crate provides:
//! - Control sources for the dataset control list and ACL tables
//!   (Supabase REST, Google spreadsheet CSV, in-memory)
//! - The control registry with JSON snapshot fallback
//! - Remote commit lookup on the GitHub API
//! - GitHub App installation tokens

pub mod commits;
pub mod error;
pub mod github;
pub mod registry;
pub mod snapshot;
pub mod source;

pub use commits::{CommitLookup, GithubCommitLookup};
pub use error::{RegistryError, RegistryResult};
pub use github::GithubAuth;
pub use registry::{ControlRegistry, ControlSnapshot, Origin, RefreshReport};
pub use snapshot::{SnapshotStore, timestamped_name};
pub use source::{ControlSource, SpreadsheetSource, StaticSource, SupabaseSource};
