use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use tokio::time::Duration;
use waffle_core::{GitAction, JobId, JobProgress};
use waffle_git::{GitBackend, GitError, GitJobSpec, GitResult, ProgressFn};

/// Build a job spec for `branch` of dataset `slug`.
#[allow(dead_code)]
pub fn spec(root: &Path, slug: &str, branch: &str, action: GitAction) -> GitJobSpec {
    GitJobSpec {
        id: JobId::for_branch(slug, branch),
        dir: root.join(slug).join(branch),
        url: format!("https://example.invalid/{slug}.git"),
        branch: branch.to_string(),
        action,
        fetcher_identity: None,
    }
}

/// Backend that fails a scripted number of times per job and can hold jobs
/// until the test releases them.
#[allow(dead_code)]
pub struct ScriptedGit {
    failures: Mutex<HashMap<JobId, u32>>,
    pub attempts: AtomicUsize,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    delay: Duration,
    head: String,
}

#[allow(dead_code)]
impl ScriptedGit {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            attempts: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            gate: None,
            delay: Duration::ZERO,
            head: "abcdef1234567890".to_string(),
        }
    }

    /// Every job waits for a permit on `gate` before finishing.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `times` attempts of job `id`.
    pub fn fail(&self, id: &JobId, times: u32) {
        self.failures.lock().unwrap().insert(id.clone(), times);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    async fn attempt(&self, spec: &GitJobSpec, progress: &ProgressFn) -> GitResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        progress(JobProgress {
            phase: "Receiving objects".to_string(),
            loaded: Some(1),
            total: Some(2),
        });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(gate) = &self.gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let mut failures = self.failures.lock().unwrap();
        if let Some(left) = failures.get_mut(&spec.id)
            && *left > 0
        {
            *left -= 1;
            return Err(GitError::Command {
                command: spec.action.as_str().to_string(),
                status: "exit status: 128".to_string(),
                stderr: "fatal: unable to access remote".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl GitBackend for ScriptedGit {
    async fn clone_branch(&self, spec: &GitJobSpec, progress: ProgressFn) -> GitResult<()> {
        self.attempt(spec, &progress).await
    }

    async fn fetch_and_checkout(
        &self,
        spec: &GitJobSpec,
        _commit: &str,
        progress: ProgressFn,
    ) -> GitResult<()> {
        self.attempt(spec, &progress).await
    }

    async fn resolve_head(&self, _dir: &Path) -> GitResult<String> {
        Ok(self.head.clone())
    }

    fn backend_name(&self) -> &'static str {
        "scripted"
    }
}
