//! Core domain types and shared logic for the waffle dataset gateway.
//!
//! This crate defines the data model used across all other crates:
//! - Dataset control entries and the branch/commit map
//! - Commit abbreviation and matching rules
//! - Access control levels, scopes and rows
//! - Sync jobs, job progress and the server-wide sync status log
//! - Event ledger fields and records
//! - Application configuration

pub mod acl;
pub mod config;
pub mod dataset;
pub mod error;
pub mod event;
pub mod sync;

pub use acl::{AccessControlRow, AccessLevel, AclScope};
pub use dataset::{
    BranchCommits, DatasetControlList, DatasetEntry, abbreviate_commit, commits_match,
};
pub use error::{Error, Result};
pub use event::{EventFields, EventKind, EventRecord};
pub use sync::{GitAction, JobId, JobProgress, JobState, SyncEvent, SyncStatus};

/// Length of the abbreviated commit hash used in canonical URLs.
///
/// Collisions between abbreviations are not detected.
pub const COMMIT_ABBREV_LEN: usize = 7;
