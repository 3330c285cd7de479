//! Single-concurrency git worker.
//!
//! Every clone, fetch and checkout goes through one actor task that owns the
//! job table and runs at most one job at a time, so no two git processes ever
//! touch the same working directory. Handles talk to the actor over a private
//! channel; once the actor is gone every call fails with
//! [`GitError::WorkerUnavailable`] and callers fall back to running the job
//! themselves.

use crate::error::{GitError, GitResult};
use crate::traits::{GitBackend, GitJobSpec, ProgressFn, run_job};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use waffle_core::{JobId, JobProgress, JobState};

const CHANNEL_CAPACITY: usize = 256;
/// Error text kept per job.
const MAX_ERROR_LEN: usize = 500;
/// Finished jobs kept for introspection.
const MAX_FINISHED_JOBS: usize = 256;

/// Worker retry policy.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Attempts before a job is marked as failed.
    pub max_tries: u32,
    /// Retry `n` waits `backoff_base * n^2`.
    pub backoff_base: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_tries: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn from_sync_config(config: &waffle_core::config::SyncConfig) -> Self {
        Self {
            max_tries: config.max_tries,
            backoff_base: config.backoff_base(),
        }
    }

    fn backoff(&self, tries: u32) -> Duration {
        self.backoff_base.saturating_mul(tries.saturating_mul(tries))
    }
}

/// Externally visible state of a job.
#[derive(Clone, Debug, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub state: JobState,
    pub progress: JobProgress,
    /// Attempts started so far.
    pub tries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub spec: GitJobSpec,
}

struct JobEntry {
    snapshot: JobSnapshot,
    not_before: Option<Instant>,
}

enum Command {
    Enqueue {
        spec: GitJobSpec,
        reply: oneshot::Sender<JobSnapshot>,
    },
    Status {
        id: JobId,
        reply: oneshot::Sender<Option<JobSnapshot>>,
    },
    Cancel {
        id: JobId,
        reply: oneshot::Sender<bool>,
    },
    List {
        reply: oneshot::Sender<Vec<JobSnapshot>>,
    },
    Progress {
        id: JobId,
        progress: JobProgress,
    },
    Finished {
        id: JobId,
        result: Result<(), String>,
    },
    Shutdown,
}

/// Handle to the git worker.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<Command>,
}

impl WorkerHandle {
    /// Spawn the worker actor on the current runtime.
    pub fn spawn(backend: Arc<dyn GitBackend>, config: WorkerConfig) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let actor = Worker {
            backend,
            config,
            jobs: HashMap::new(),
            queue: VecDeque::new(),
            running: None,
            tx: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx));
        tracing::info!("Git worker started");
        Self { tx }
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> GitResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| GitError::WorkerUnavailable)?;
        rx.await.map_err(|_| GitError::WorkerUnavailable)
    }

    /// Queue a job. A job with the same id that is queued or running is
    /// returned unchanged instead of being queued twice.
    pub async fn enqueue(&self, spec: GitJobSpec) -> GitResult<JobSnapshot> {
        self.call(|reply| Command::Enqueue { spec, reply }).await
    }

    pub async fn status(&self, id: &JobId) -> GitResult<Option<JobSnapshot>> {
        let id = id.clone();
        self.call(|reply| Command::Status { id, reply }).await
    }

    /// Cancel a queued job. Running jobs are never interrupted.
    pub async fn cancel(&self, id: &JobId) -> GitResult<bool> {
        let id = id.clone();
        self.call(|reply| Command::Cancel { id, reply }).await
    }

    /// Every known job, oldest update first.
    pub async fn list(&self) -> GitResult<Vec<JobSnapshot>> {
        self.call(|reply| Command::List { reply }).await
    }

    /// Poll `id` every `interval` until it reaches a final state or `timeout` passes.
    ///
    /// `observe` sees every snapshot read along the way, the final one included.
    pub async fn wait_for(
        &self,
        id: &JobId,
        interval: Duration,
        timeout: Duration,
        mut observe: impl FnMut(&JobSnapshot),
    ) -> GitResult<JobSnapshot> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self
                .status(id)
                .await?
                .ok_or_else(|| GitError::UnknownJob(id.to_string()))?;
            observe(&job);
            if job.state.is_terminal() {
                return Ok(job);
            }
            if Instant::now() >= deadline {
                return Err(GitError::PollTimeout {
                    job: id.to_string(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Stop the actor. A running job is left to finish on its own; its
    /// result is dropped.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

struct Worker {
    backend: Arc<dyn GitBackend>,
    config: WorkerConfig,
    jobs: HashMap<JobId, JobEntry>,
    /// Queued job ids in arrival order.
    queue: VecDeque<JobId>,
    running: Option<JobId>,
    tx: mpsc::WeakSender<Command>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            let wake = self.next_wake();
            let command = tokio::select! {
                command = rx.recv() => command,
                _ = sleep_until(wake), if wake.is_some() => {
                    self.tick();
                    continue;
                }
            };
            match command {
                Some(Command::Shutdown) | None => break,
                Some(command) => self.handle(command),
            }
            self.tick();
        }
        tracing::info!("Git worker stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { spec, reply } => {
                let _ = reply.send(self.enqueue(spec));
            }
            Command::Status { id, reply } => {
                let _ = reply.send(self.jobs.get(&id).map(|j| j.snapshot.clone()));
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(&id));
            }
            Command::List { reply } => {
                let mut jobs: Vec<_> = self.jobs.values().map(|j| j.snapshot.clone()).collect();
                jobs.sort_by_key(|j| j.updated_at);
                let _ = reply.send(jobs);
            }
            Command::Progress { id, progress } => {
                if let Some(job) = self.jobs.get_mut(&id)
                    && job.snapshot.state == JobState::Running
                {
                    job.snapshot.progress = progress;
                    job.snapshot.updated_at = OffsetDateTime::now_utc();
                }
            }
            Command::Finished { id, result } => self.finish(&id, result),
            Command::Shutdown => {}
        }
    }

    fn enqueue(&mut self, spec: GitJobSpec) -> JobSnapshot {
        if let Some(existing) = self.jobs.get(&spec.id)
            && existing.snapshot.state.is_active()
        {
            tracing::debug!(job = %spec.id, state = %existing.snapshot.state, "Job already in flight");
            return existing.snapshot.clone();
        }

        let snapshot = JobSnapshot {
            id: spec.id.clone(),
            state: JobState::Queued,
            progress: JobProgress::phase("Queued"),
            tries: 0,
            last_error: None,
            updated_at: OffsetDateTime::now_utc(),
            spec,
        };
        tracing::info!(job = %snapshot.id, action = snapshot.spec.action.as_str(), "Job queued");
        self.queue.push_back(snapshot.id.clone());
        self.jobs.insert(
            snapshot.id.clone(),
            JobEntry {
                snapshot: snapshot.clone(),
                not_before: None,
            },
        );
        snapshot
    }

    fn cancel(&mut self, id: &JobId) -> bool {
        match self.jobs.get(id) {
            Some(job) if job.snapshot.state == JobState::Queued => {
                self.jobs.remove(id);
                self.queue.retain(|queued| queued != id);
                tracing::info!(job = %id, "Job canceled");
                true
            }
            _ => false,
        }
    }

    fn finish(&mut self, id: &JobId, result: Result<(), String>) {
        if self.running.as_ref() == Some(id) {
            self.running = None;
        }
        let Some(job) = self.jobs.get_mut(id) else {
            return;
        };
        let now = OffsetDateTime::now_utc();
        job.snapshot.updated_at = now;

        match result {
            Ok(()) => {
                job.snapshot.state = JobState::Done;
                job.snapshot.progress = JobProgress::phase("Job done");
                tracing::info!(job = %id, tries = job.snapshot.tries, "Job done");
            }
            Err(error) => {
                let error = truncate(error, MAX_ERROR_LEN);
                let tries = job.snapshot.tries;
                if tries < self.config.max_tries {
                    let delay = self.config.backoff(tries);
                    tracing::warn!(job = %id, tries, error = %error, retry_in = ?delay, "Job failed, retrying");
                    job.snapshot.state = JobState::Queued;
                    job.snapshot.progress = JobProgress::phase(format!("Retrying in {delay:?}"));
                    job.not_before = Some(Instant::now() + delay);
                    self.queue.push_back(id.clone());
                } else {
                    tracing::error!(job = %id, tries, error = %error, "Job failed permanently");
                    job.snapshot.state = JobState::Error;
                    job.snapshot.progress = JobProgress::phase("Job failed");
                }
                job.snapshot.last_error = Some(error);
            }
        }
        self.prune_finished();
    }

    /// Earliest time a queued job becomes runnable, when none is runnable now.
    fn next_wake(&self) -> Option<Instant> {
        if self.running.is_some() {
            return None;
        }
        self.queue
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .map(|job| job.not_before.unwrap_or_else(Instant::now))
            .min()
    }

    /// Start the first runnable queued job, if nothing is running.
    fn tick(&mut self) {
        if self.running.is_some() {
            return;
        }
        let now = Instant::now();
        let Some(pos) = self.queue.iter().position(|id| {
            self.jobs
                .get(id)
                .is_some_and(|job| job.not_before.is_none_or(|at| at <= now))
        }) else {
            return;
        };
        let Some(id) = self.queue.remove(pos) else {
            return;
        };
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };

        job.snapshot.state = JobState::Running;
        job.snapshot.tries += 1;
        job.snapshot.progress = JobProgress::phase("Starting...");
        job.snapshot.updated_at = OffsetDateTime::now_utc();
        job.not_before = None;
        self.running = Some(id.clone());

        tracing::info!(job = %id, attempt = job.snapshot.tries, "Job started");
        let spec = job.snapshot.spec.clone();
        let backend = self.backend.clone();
        tokio::spawn(async move {
            let progress_tx = tx.clone();
            let progress_id = id.clone();
            let progress: ProgressFn = Arc::new(move |progress| {
                let _ = progress_tx.try_send(Command::Progress {
                    id: progress_id.clone(),
                    progress,
                });
            });
            // An inner task so a panicking backend still reports a result
            let result = tokio::spawn(async move {
                run_job(backend.as_ref(), &spec, progress)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await
            .unwrap_or_else(|e| Err(format!("git job panicked: {e}")));
            let _ = tx.send(Command::Finished { id, result }).await;
        });
    }

    fn prune_finished(&mut self) {
        let mut finished: Vec<_> = self
            .jobs
            .values()
            .filter(|j| j.snapshot.state.is_terminal())
            .map(|j| (j.snapshot.updated_at, j.snapshot.id.clone()))
            .collect();
        if finished.len() <= MAX_FINISHED_JOBS {
            return;
        }
        finished.sort();
        let excess = finished.len() - MAX_FINISHED_JOBS;
        for (_, id) in finished.into_iter().take(excess) {
            self.jobs.remove(&id);
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}
