//! Sync jobs and the server-wide sync status log.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Identifier of a git job: one per (dataset, branch).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Build the job id for a dataset branch.
    pub fn for_branch(slug: &str, branch: &str) -> Self {
        Self(format!("{slug}:{branch}"))
    }

    /// Parse from a string of the form `slug:branch`.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s.split_once(':') {
            Some((slug, branch)) if !slug.is_empty() && !branch.is_empty() => Ok(Self(s.to_string())),
            _ => Err(crate::Error::InvalidJobId(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Git job lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Error,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    /// Whether the job is queued or running.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Whether the job reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress reported by a running git operation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl JobProgress {
    /// Progress with only a phase description.
    pub fn phase(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            loaded: None,
            total: None,
        }
    }
}

impl fmt::Display for JobProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.loaded, self.total) {
            (Some(loaded), Some(total)) => write!(f, "{} {loaded} / {total}", self.phase),
            (Some(loaded), None) => write!(f, "{} {loaded}", self.phase),
            _ => write!(f, "{}", self.phase),
        }
    }
}

/// Git mutation requested from the worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GitAction {
    /// Shallow single-branch clone into an empty directory.
    Clone,
    /// Fetch the branch and force-checkout `commit`.
    Fetch { commit: String },
}

impl GitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clone => "clone",
            Self::Fetch { .. } => "fetch",
        }
    }
}

/// One line of the sync status log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub comment: String,
}

/// Server-wide sync status, visible to operators while a sync runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub ongoing: bool,
    pub events: Vec<SyncEvent>,
}

impl SyncStatus {
    /// Append a comment, or replace the last one when `new_entry` is false.
    ///
    /// Replacing keeps progress updates from flooding the log.
    pub fn log(&mut self, comment: impl Into<String>, new_entry: bool) {
        let event = SyncEvent {
            timestamp: OffsetDateTime::now_utc(),
            comment: comment.into(),
        };
        match self.events.last_mut() {
            Some(last) if !new_entry => *last = event,
            _ => self.events.push(event),
        }
    }

    /// Start a new top-level sync.
    pub fn begin(&mut self) {
        self.ongoing = true;
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_roundtrip() {
        let id = JobId::for_branch("ds1", "master");
        assert_eq!(id.as_str(), "ds1:master");
        assert_eq!(JobId::parse("ds1:master").unwrap(), id);
        assert!(JobId::parse("ds1").is_err());
        assert!(JobId::parse(":master").is_err());
    }

    #[test]
    fn test_status_log_replace_and_append() {
        let mut status = SyncStatus::default();
        status.log("first", false);
        assert_eq!(status.events.len(), 1);

        status.log("progress 1", true);
        status.log("progress 2", false);
        assert_eq!(status.events.len(), 2);
        assert_eq!(status.events[1].comment, "progress 2");

        status.begin();
        assert!(status.ongoing);
        assert!(status.events.is_empty());
    }

    #[test]
    fn test_progress_display() {
        let p = JobProgress {
            phase: "Receiving objects".to_string(),
            loaded: Some(3),
            total: Some(10),
        };
        assert_eq!(p.to_string(), "Receiving objects 3 / 10");
        assert_eq!(JobProgress::phase("Cloning").to_string(), "Cloning");
    }

    #[test]
    fn test_state_flags() {
        assert!(JobState::Queued.is_active());
        assert!(JobState::Running.is_active());
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Error.is_terminal());
        assert!(!JobState::Error.is_active());
    }
}
