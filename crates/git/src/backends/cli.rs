//! Git backend driving the system `git` binary.

use crate::error::{GitError, GitResult};
use crate::traits::{GitBackend, GitJobSpec, ProgressFn};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::instrument;
use waffle_core::JobProgress;
use waffle_registry::GithubAuth;

/// Stderr kept in error messages.
const MAX_STDERR: usize = 500;

/// `git` CLI backend. Credentials are passed per command as an HTTP header,
/// never written to the repository config.
pub struct CliGit {
    auth: Arc<GithubAuth>,
}

impl CliGit {
    pub fn new(auth: Arc<GithubAuth>) -> Self {
        Self { auth }
    }

    /// Check if git is available on PATH.
    pub async fn ensure_available() -> GitResult<()> {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|_| GitError::GitNotAvailable)?;
        Ok(())
    }

    async fn auth_args(&self, spec: &GitJobSpec) -> GitResult<Vec<String>> {
        let token = self
            .auth
            .token_for(spec.fetcher_identity.as_deref())
            .await
            .map_err(|e| GitError::Credentials(e.to_string()))?;
        Ok(match token {
            Some(token) => {
                let basic = STANDARD.encode(format!("x-access-token:{token}"));
                vec![
                    "-c".to_string(),
                    format!("http.extraHeader=Authorization: Basic {basic}"),
                ]
            }
            None => Vec::new(),
        })
    }

    /// Run git with `args`, streaming progress lines from stderr.
    async fn run(
        &self,
        dir: Option<&Path>,
        auth: &[String],
        args: &[&str],
        progress: &ProgressFn,
    ) -> GitResult<String> {
        let mut command = Command::new("git");
        command
            .args(auth)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => GitError::GitNotAvailable,
            _ => GitError::Io(e),
        })?;

        let mut stdout = child.stdout.take();
        let stdout_task = tokio::spawn(async move {
            let mut out = String::new();
            if let Some(stdout) = stdout.as_mut() {
                let _ = stdout.read_to_string(&mut out).await;
            }
            out
        });

        let mut stderr_tail = String::new();
        if let Some(mut stderr) = child.stderr.take() {
            let mut buf = [0u8; 4096];
            let mut pending = String::new();
            loop {
                let n = stderr.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                // git redraws progress with \r, so both separators end a line
                while let Some(pos) = pending.find(['\r', '\n']) {
                    let line: String = pending.drain(..=pos).collect();
                    let line = line.trim();
                    if let Some(p) = parse_progress(line) {
                        progress(p);
                    } else if !line.is_empty() {
                        push_tail(&mut stderr_tail, line);
                    }
                }
            }
            push_tail(&mut stderr_tail, pending.trim());
        }

        let status = child.wait().await?;
        let stdout = stdout_task.await.unwrap_or_default();
        if status.success() {
            Ok(stdout)
        } else {
            Err(GitError::Command {
                command: args.first().copied().unwrap_or_default().to_string(),
                status: status.to_string(),
                stderr: stderr_tail,
            })
        }
    }
}

fn push_tail(tail: &mut String, line: &str) {
    if line.is_empty() {
        return;
    }
    if !tail.is_empty() {
        tail.push('\n');
    }
    tail.push_str(line);
    if tail.len() > MAX_STDERR {
        let mut cut = tail.len() - MAX_STDERR;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}

/// Parse a git progress line such as `Receiving objects:  45% (45/100), 1 MiB`.
fn parse_progress(line: &str) -> Option<JobProgress> {
    let line = line.strip_prefix("remote: ").unwrap_or(line);
    let (phase, rest) = line.split_once(':')?;
    let rest = rest.trim();
    if !rest.starts_with(|c: char| c.is_ascii_digit()) || !rest.contains('%') {
        return None;
    }
    let counts = rest
        .split_once('(')
        .and_then(|(_, r)| r.split_once(')'))
        .and_then(|(inner, _)| inner.split_once('/'));
    let (loaded, total) = match counts {
        Some((a, b)) => (a.trim().parse().ok(), b.trim().parse().ok()),
        None => (None, None),
    };
    Some(JobProgress {
        phase: phase.trim().to_string(),
        loaded,
        total,
    })
}

#[async_trait]
impl GitBackend for CliGit {
    #[instrument(skip(self, spec, progress), fields(job = %spec.id, backend = "cli"))]
    async fn clone_branch(&self, spec: &GitJobSpec, progress: ProgressFn) -> GitResult<()> {
        let dest = spec
            .dir
            .to_str()
            .ok_or_else(|| GitError::InvalidPath(spec.dir.display().to_string()))?;
        if fs::try_exists(&spec.dir).await? {
            fs::remove_dir_all(&spec.dir).await?;
        }
        if let Some(parent) = spec.dir.parent() {
            fs::create_dir_all(parent).await?;
        }

        let auth = self.auth_args(spec).await?;
        tracing::info!(url = %spec.url, branch = %spec.branch, "Cloning");
        self.run(
            None,
            &auth,
            &[
                "clone",
                "--depth",
                "1",
                "--single-branch",
                "--no-tags",
                "--progress",
                "--branch",
                &spec.branch,
                &spec.url,
                dest,
            ],
            &progress,
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, spec, progress), fields(job = %spec.id, backend = "cli"))]
    async fn fetch_and_checkout(
        &self,
        spec: &GitJobSpec,
        commit: &str,
        progress: ProgressFn,
    ) -> GitResult<()> {
        let auth = self.auth_args(spec).await?;
        self.run(
            Some(&spec.dir),
            &auth,
            &[
                "fetch",
                "--depth",
                "1",
                "--no-tags",
                "--progress",
                "origin",
                &spec.branch,
            ],
            &progress,
        )
        .await?;

        progress(JobProgress::phase("Checking out the latest commit..."));
        self.run(
            Some(&spec.dir),
            &[],
            &["checkout", "--force", "--detach", commit],
            &progress,
        )
        .await?;
        Ok(())
    }

    async fn resolve_head(&self, dir: &Path) -> GitResult<String> {
        let out = self
            .run(
                Some(dir),
                &[],
                &["rev-parse", "HEAD"],
                &crate::traits::no_progress(),
            )
            .await?;
        Ok(out.trim().to_string())
    }

    fn backend_name(&self) -> &'static str {
        "cli"
    }
}
