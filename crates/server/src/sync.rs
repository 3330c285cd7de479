//! Sync orchestrator.
//!
//! A top-level sync refreshes the control tables, evicts directories of
//! datasets and branches that are no longer listed, then brings every
//! (dataset, branch) in scope up to the remote commit:
//!
//! 1. look up the remote commit
//! 2. clone the branch unless its marker file exists
//! 3. fetch and check out the remote commit if the local HEAD differs
//! 4. open a fresh reader on the working copy and swap it in
//! 5. publish the commit to the branch-commit map
//!
//! Git mutations go through the worker. A failing branch is logged into the
//! sync status and the run moves on to the next one.

use crate::access::{AccessResolver, Requester};
use crate::metrics;
use crate::reader::{ReaderError, ReaderFactory, ReaderTable};
use crate::versions::VersionMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use waffle_core::config::AppConfig;
use waffle_core::{DatasetControlList, DatasetEntry, GitAction, JobId, JobState, SyncStatus, commits_match};
use waffle_git::{DatasetLayout, GitBackend, GitError, GitJobSpec, WorkerHandle, no_progress, run_job};
use waffle_registry::{CommitLookup, ControlRegistry, RegistryError};

/// What a sync covers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncScope {
    All,
    Dataset(String),
    Branch(String, String),
}

impl fmt::Display for SyncScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all datasets"),
            Self::Dataset(slug) => write!(f, "{slug}"),
            Self::Branch(slug, branch) => write!(f, "{slug}/{branch}"),
        }
    }
}

/// On whose behalf a sync runs.
#[derive(Clone, Debug)]
pub enum SyncAuthority {
    /// Startup and scheduled syncs: every listed dataset.
    System,
    /// Operator request: only datasets the requester may edit.
    Requester(Requester),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote commit lookup failed: {0}")]
    Lookup(#[from] RegistryError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("reader failed: {0}")]
    Reader(#[from] ReaderError),

    #[error("checked out {found} but the remote is at {expected}")]
    CheckoutMismatch { expected: String, found: String },
}

/// Result of syncing one branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BranchSync {
    /// Local HEAD already matched the remote.
    Unchanged { commit: String },
    /// Cloned or fetched to the remote commit.
    Updated { commit: String },
}

impl BranchSync {
    fn label(&self) -> &'static str {
        match self {
            Self::Unchanged { .. } => "unchanged",
            Self::Updated { .. } => "updated",
        }
    }
}

/// Collaborators of the orchestrator.
pub struct SyncParts {
    pub registry: Arc<ControlRegistry>,
    pub access: Arc<AccessResolver>,
    pub commits: Arc<dyn CommitLookup>,
    pub backend: Arc<dyn GitBackend>,
    pub worker: WorkerHandle,
    pub versions: Arc<VersionMap>,
    pub readers: Arc<ReaderTable>,
    pub factory: Arc<dyn ReaderFactory>,
}

pub struct SyncOrchestrator {
    registry: Arc<ControlRegistry>,
    access: Arc<AccessResolver>,
    commits: Arc<dyn CommitLookup>,
    backend: Arc<dyn GitBackend>,
    worker: WorkerHandle,
    versions: Arc<VersionMap>,
    readers: Arc<ReaderTable>,
    factory: Arc<dyn ReaderFactory>,
    layout: DatasetLayout,
    status: Mutex<SyncStatus>,
    clone_base: String,
    poll_interval: Duration,
    poll_timeout: Duration,
}

/// Clears `ongoing` however the run ends.
struct OngoingGuard(Arc<SyncOrchestrator>);

impl Drop for OngoingGuard {
    fn drop(&mut self) {
        self.0.lock_status().ongoing = false;
        metrics::SYNC_ONGOING.set(0);
    }
}

impl SyncOrchestrator {
    pub fn new(parts: SyncParts, config: &AppConfig) -> Self {
        Self {
            registry: parts.registry,
            access: parts.access,
            commits: parts.commits,
            backend: parts.backend,
            worker: parts.worker,
            versions: parts.versions,
            readers: parts.readers,
            factory: parts.factory,
            layout: DatasetLayout::new(
                config.server.datasets_root.clone(),
                config.sync.marker_file.clone(),
            ),
            status: Mutex::new(SyncStatus::default()),
            clone_base: config.github.clone_base.trim_end_matches('/').to_string(),
            poll_interval: config.sync.poll_interval(),
            poll_timeout: config.sync.poll_timeout(),
        }
    }

    fn lock_status(&self) -> MutexGuard<'_, SyncStatus> {
        match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current sync status.
    pub fn status(&self) -> SyncStatus {
        self.lock_status().clone()
    }

    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    fn log(&self, comment: impl Into<String>, new_entry: bool) {
        let comment = comment.into();
        if new_entry {
            tracing::info!("{comment}");
        } else {
            tracing::debug!("{comment}");
        }
        self.lock_status().log(comment, new_entry);
    }

    /// Start a sync of `scope` in the background unless one is running.
    ///
    /// Returns the status right after the check: unchanged if a sync was
    /// already running, freshly reset otherwise.
    pub fn sync_if_not_already_syncing(
        self: &Arc<Self>,
        scope: SyncScope,
        authority: SyncAuthority,
    ) -> SyncStatus {
        let started = {
            let mut status = self.lock_status();
            if status.ongoing {
                tracing::debug!(%scope, "Sync already in progress, not starting another");
                return status.clone();
            }
            status.begin();
            status.log(format!("Sync started: {scope}"), true);
            status.clone()
        };
        tracing::info!(%scope, "Sync started");
        metrics::SYNC_RUNS.inc();
        metrics::SYNC_ONGOING.set(1);

        let guard = OngoingGuard(Arc::clone(self));
        tokio::spawn(async move {
            guard.0.run_sync(scope, authority).await;
            drop(guard);
        });
        started
    }

    async fn run_sync(&self, scope: SyncScope, authority: SyncAuthority) {
        match self.registry.refresh().await {
            Ok(report) if !report.fully_fresh() => self.log(
                "Control source unavailable, continuing with backed up tables",
                true,
            ),
            Ok(_) => {}
            Err(e) => self.log(format!("Control tables refresh failed: {e}"), true),
        }
        let control = self.registry.current();
        self.access.reload(&control);
        let datasets = &control.datasets;

        match self.layout.cleanup(datasets).await {
            Ok(removed) if !removed.is_empty() => {
                self.log(format!("Removed {} unlisted directories", removed.len()), true);
            }
            Ok(_) => {}
            Err(e) => self.log(format!("Directory cleanup failed: {e}"), true),
        }
        self.versions.retain_listed(datasets);
        self.readers.retain_listed(datasets);

        let targets = self.targets(datasets, &scope, &authority);
        let mut synced = 0usize;
        let mut failed = 0usize;
        for (dataset, branches) in &targets {
            for branch in branches {
                match self.sync_branch(dataset, branch).await {
                    Ok(result) => {
                        synced += 1;
                        metrics::SYNC_BRANCH_RESULTS
                            .with_label_values(&[result.label()])
                            .inc();
                        let (BranchSync::Unchanged { commit } | BranchSync::Updated { commit }) =
                            &result;
                        self.log(
                            format!("{}/{branch}: {} at {commit}", dataset.slug, result.label()),
                            true,
                        );
                    }
                    Err(e) => {
                        failed += 1;
                        metrics::SYNC_BRANCH_RESULTS
                            .with_label_values(&["failed"])
                            .inc();
                        tracing::error!(slug = %dataset.slug, branch = %branch, error = ?e, "Branch sync failed");
                        self.log(format!("{}/{branch}: sync failed: {e}", dataset.slug), true);
                    }
                }
            }
        }
        self.log(
            format!("Sync finished: {synced} branches synced, {failed} failed"),
            true,
        );
    }

    /// Datasets and branches covered by `scope`, restricted to what `authority` may edit.
    fn targets(
        &self,
        datasets: &DatasetControlList,
        scope: &SyncScope,
        authority: &SyncAuthority,
    ) -> Vec<(DatasetEntry, Vec<String>)> {
        let allowed = |dataset: &DatasetEntry| match authority {
            SyncAuthority::System => true,
            SyncAuthority::Requester(requester) => self.access.can_edit(requester, &dataset.slug),
        };
        let lookup = |slug: &str| {
            let found = datasets.get(slug).filter(|d| allowed(d));
            if found.is_none() {
                self.log(format!("{slug}: not configured or not editable, skipping"), true);
            }
            found
        };

        match scope {
            SyncScope::All => datasets
                .iter()
                .filter(|d| allowed(d))
                .map(|d| (d.clone(), d.branches.clone()))
                .collect(),
            SyncScope::Dataset(slug) => lookup(slug)
                .map(|d| vec![(d.clone(), d.branches.clone())])
                .unwrap_or_default(),
            SyncScope::Branch(slug, branch) => match lookup(slug) {
                Some(d) if d.has_branch(branch) => vec![(d.clone(), vec![branch.clone()])],
                Some(_) => {
                    self.log(format!("{slug}/{branch}: branch not configured, skipping"), true);
                    Vec::new()
                }
                None => Vec::new(),
            },
        }
    }

    fn job_spec(&self, dataset: &DatasetEntry, branch: &str, action: GitAction) -> GitJobSpec {
        GitJobSpec {
            id: JobId::for_branch(&dataset.slug, branch),
            dir: self.layout.branch_dir(dataset, branch),
            url: format!("{}/{}.git", self.clone_base, dataset.repo_id),
            branch: branch.to_string(),
            action,
            fetcher_identity: dataset.fetcher_identity.clone(),
        }
    }

    /// Bring one branch up to the remote commit.
    pub async fn sync_branch(
        &self,
        dataset: &DatasetEntry,
        branch: &str,
    ) -> Result<BranchSync, SyncError> {
        let slug = &dataset.slug;
        self.log(format!("{slug}/{branch}: looking up remote commit"), true);
        let remote = self.commits.latest_commit(dataset, branch).await?;
        let dir = self.layout.branch_dir(dataset, branch);

        let mut changed = false;
        if !self.layout.is_materialized(dataset, branch).await {
            self.run_git(self.job_spec(dataset, branch, GitAction::Clone))
                .await?;
            changed = true;
        }

        let mut head = self.backend.resolve_head(&dir).await?;
        if !commits_match(&head, &remote) {
            let fetch = GitAction::Fetch {
                commit: remote.clone(),
            };
            self.run_git(self.job_spec(dataset, branch, fetch)).await?;
            changed = true;
            head = self.backend.resolve_head(&dir).await?;
            if !commits_match(&head, &remote) {
                return Err(SyncError::CheckoutMismatch {
                    expected: remote,
                    found: head,
                });
            }
        }

        let reader = self.factory.open(dataset, branch, &dir).await?;
        self.readers.install(slug, branch, reader);
        self.versions.publish(slug, branch, &head);

        Ok(if changed {
            BranchSync::Updated { commit: head }
        } else {
            BranchSync::Unchanged { commit: head }
        })
    }

    /// Run a job on the worker and poll it to completion.
    async fn run_git(&self, spec: GitJobSpec) -> Result<(), SyncError> {
        let label = format!("{} {}", spec.action.as_str(), spec.id);
        match self.worker.enqueue(spec.clone()).await {
            Ok(_) => {}
            Err(GitError::WorkerUnavailable) => return self.run_git_in_process(&label, spec).await,
            Err(e) => return Err(e.into()),
        }
        self.log(format!("{label}: queued"), true);

        let polled = self
            .worker
            .wait_for(&spec.id, self.poll_interval, self.poll_timeout, |job| {
                self.log(format!("{label}: {} {}", job.state, job.progress), false)
            })
            .await;
        let job = match polled {
            Ok(job) => job,
            Err(e @ GitError::PollTimeout { .. }) => {
                metrics::GIT_JOBS_FINISHED.with_label_values(&["timeout"]).inc();
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        if job.state == JobState::Done {
            metrics::GIT_JOBS_FINISHED.with_label_values(&["done"]).inc();
            Ok(())
        } else {
            metrics::GIT_JOBS_FINISHED.with_label_values(&["error"]).inc();
            Err(GitError::JobFailed {
                job: spec.id.to_string(),
                error: job.last_error.unwrap_or_default(),
            }
            .into())
        }
    }

    /// Degraded mode: no retries and no single-writer guarantee.
    async fn run_git_in_process(&self, label: &str, spec: GitJobSpec) -> Result<(), SyncError> {
        tracing::warn!(job = %spec.id, "Git worker unavailable, running job in-process");
        self.log(format!("{label}: git worker unavailable, running in-process"), true);
        run_job(self.backend.as_ref(), &spec, no_progress()).await?;
        Ok(())
    }

    /// Publish the checked out HEAD of every materialized branch and open
    /// its reader. Touches neither the network nor the worker.
    ///
    /// Returns the number of branches loaded.
    pub async fn load_from_disk(&self) -> usize {
        let datasets = self.registry.datasets();
        let mut loaded = 0;
        for dataset in datasets.iter() {
            for branch in &dataset.branches {
                if !self.layout.is_materialized(dataset, branch).await {
                    continue;
                }
                let dir = self.layout.branch_dir(dataset, branch);
                let head = match self.backend.resolve_head(&dir).await {
                    Ok(head) => head,
                    Err(e) => {
                        tracing::warn!(slug = %dataset.slug, branch = %branch, error = %e, "Cannot read local HEAD");
                        continue;
                    }
                };
                match self.factory.open(dataset, branch, &dir).await {
                    Ok(reader) => self.readers.install(&dataset.slug, branch, reader),
                    Err(e) => {
                        tracing::warn!(slug = %dataset.slug, branch = %branch, error = %e, "Cannot open reader");
                        continue;
                    }
                }
                self.versions.publish(&dataset.slug, branch, &head);
                loaded += 1;
            }
        }
        tracing::info!(branches = loaded, "Loaded datasets from disk");
        loaded
    }
}
