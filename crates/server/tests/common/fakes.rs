//! Fakes of the outside world: remote commit lookup and git.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use waffle_core::{DatasetEntry, JobProgress};
use waffle_git::{GitBackend, GitError, GitJobSpec, GitResult, ProgressFn};
use waffle_registry::{CommitLookup, RegistryError, RegistryResult};

/// File where [`FakeGit`] keeps the checked out commit.
pub const HEAD_FILE: &str = ".fake-head";

/// Remote branch tips, keyed by `(slug, branch)`.
#[allow(dead_code)]
#[derive(Default)]
pub struct FakeRemote {
    tips: Mutex<HashMap<(String, String), String>>,
    failing: Mutex<HashSet<(String, String)>>,
    pub lookups: AtomicUsize,
}

#[allow(dead_code)]
impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, slug: &str, branch: &str, commit: &str) {
        self.tips
            .lock()
            .unwrap()
            .insert((slug.to_string(), branch.to_string()), commit.to_string());
    }

    pub fn tip(&self, slug: &str, branch: &str) -> Option<String> {
        self.tips
            .lock()
            .unwrap()
            .get(&(slug.to_string(), branch.to_string()))
            .cloned()
    }

    /// Make lookups of `slug/branch` time out.
    pub fn fail(&self, slug: &str, branch: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert((slug.to_string(), branch.to_string()));
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommitLookup for FakeRemote {
    async fn latest_commit(&self, dataset: &DatasetEntry, branch: &str) -> RegistryResult<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let key = (dataset.slug.clone(), branch.to_string());
        if self.failing.lock().unwrap().contains(&key) {
            return Err(RegistryError::Timeout(std::time::Duration::from_secs(10)));
        }
        self.tip(&dataset.slug, branch)
            .ok_or_else(|| RegistryError::NotFound(format!("{}/{branch}", dataset.repo_id)))
    }
}

/// Git backend writing a `datapackage.json` and a head file instead of
/// running git. Clones check out the current tip of the [`FakeRemote`].
#[allow(dead_code)]
pub struct FakeGit {
    remote: Arc<FakeRemote>,
    pub clones: AtomicUsize,
    pub fetches: AtomicUsize,
    fail_fetches: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

#[allow(dead_code)]
impl FakeGit {
    pub fn new(remote: Arc<FakeRemote>) -> Self {
        Self {
            remote,
            clones: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            fail_fetches: AtomicBool::new(false),
            gate: Mutex::new(None),
        }
    }

    pub fn clones(&self) -> usize {
        self.clones.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Every job waits for a permit on `gate` before doing anything.
    pub fn hold(&self, gate: Arc<Semaphore>) {
        *self.gate.lock().unwrap() = Some(gate);
    }

    async fn wait_for_gate(&self) {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }
    }

    fn slug(spec: &GitJobSpec) -> String {
        spec.id
            .as_str()
            .split_once(':')
            .map(|(slug, _)| slug.to_string())
            .unwrap_or_default()
    }

    async fn write_checkout(spec: &GitJobSpec, slug: &str, commit: &str) -> GitResult<()> {
        tokio::fs::create_dir_all(&spec.dir).await?;
        let package = json!({
            "name": slug,
            "branch": spec.branch,
            "ddfSchema": {
                "concepts": [{"primaryKey": ["concept"], "value": "concept_type"}],
                "entities": [{"primaryKey": ["geo"], "value": "name"}],
                "datapoints": [{"primaryKey": ["geo", "time"], "value": "population"}]
            }
        });
        tokio::fs::write(
            spec.dir.join("datapackage.json"),
            serde_json::to_vec(&package).unwrap(),
        )
        .await?;
        tokio::fs::write(spec.dir.join(HEAD_FILE), commit).await?;
        Ok(())
    }
}

#[async_trait]
impl GitBackend for FakeGit {
    async fn clone_branch(&self, spec: &GitJobSpec, progress: ProgressFn) -> GitResult<()> {
        self.wait_for_gate().await;
        self.clones.fetch_add(1, Ordering::SeqCst);
        progress(JobProgress::phase("Receiving objects"));
        let slug = Self::slug(spec);
        let commit = self
            .remote
            .tip(&slug, &spec.branch)
            .ok_or_else(|| GitError::Command {
                command: "clone".to_string(),
                status: "exit status: 128".to_string(),
                stderr: format!("fatal: Remote branch {} not found", spec.branch),
            })?;
        Self::write_checkout(spec, &slug, &commit).await
    }

    async fn fetch_and_checkout(
        &self,
        spec: &GitJobSpec,
        commit: &str,
        progress: ProgressFn,
    ) -> GitResult<()> {
        self.wait_for_gate().await;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        progress(JobProgress::phase("Fetching objects"));
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(GitError::Command {
                command: "fetch".to_string(),
                status: "exit status: 128".to_string(),
                stderr: "fatal: unable to access remote".to_string(),
            });
        }
        Self::write_checkout(spec, &Self::slug(spec), commit).await
    }

    async fn resolve_head(&self, dir: &Path) -> GitResult<String> {
        let head = tokio::fs::read_to_string(dir.join(HEAD_FILE)).await?;
        Ok(head.trim().to_string())
    }

    fn backend_name(&self) -> &'static str {
        "fake"
    }
}
