//! Git backend trait definitions.

use crate::error::GitResult;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use waffle_core::{GitAction, JobId, JobProgress};

/// Callback receiving progress of a running git operation.
pub type ProgressFn = Arc<dyn Fn(JobProgress) + Send + Sync>;

/// A progress callback that drops every update.
pub fn no_progress() -> ProgressFn {
    Arc::new(|_| {})
}

/// Everything needed to run one git job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GitJobSpec {
    pub id: JobId,
    /// Working directory of the (dataset, branch).
    pub dir: PathBuf,
    /// Remote URL without credentials.
    pub url: String,
    pub branch: String,
    #[serde(flatten)]
    pub action: GitAction,
    /// Identity selecting the credentials used to reach the remote.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetcher_identity: Option<String>,
}

/// Git mutations against a single working directory.
///
/// Implementations are not required to serialize calls; callers route every
/// mutation through the worker so only one runs per directory.
#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Shallow single-branch clone of `spec.branch` into `spec.dir`,
    /// replacing whatever is there.
    async fn clone_branch(&self, spec: &GitJobSpec, progress: ProgressFn) -> GitResult<()>;

    /// Fetch `spec.branch` and force-checkout `commit`.
    async fn fetch_and_checkout(
        &self,
        spec: &GitJobSpec,
        commit: &str,
        progress: ProgressFn,
    ) -> GitResult<()>;

    /// Full hash of the commit checked out in `dir`.
    async fn resolve_head(&self, dir: &Path) -> GitResult<String>;

    /// Backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// Run one job against `backend`.
///
/// The worker calls this for every job; the sync orchestrator calls it
/// directly when the worker is unavailable.
pub async fn run_job(
    backend: &dyn GitBackend,
    spec: &GitJobSpec,
    progress: ProgressFn,
) -> GitResult<()> {
    match &spec.action {
        GitAction::Clone => {
            progress(JobProgress::phase("Cloning..."));
            backend.clone_branch(spec, progress.clone()).await?;
        }
        GitAction::Fetch { commit } => {
            progress(JobProgress::phase("Fetching..."));
            backend
                .fetch_and_checkout(spec, commit, progress.clone())
                .await?;
        }
    }
    progress(JobProgress::phase("Job done"));
    Ok(())
}
