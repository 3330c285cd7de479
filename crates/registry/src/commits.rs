//! Remote commit lookup.

use crate::error::{RegistryError, RegistryResult};
use crate::github::GithubAuth;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use waffle_core::DatasetEntry;
use waffle_core::config::GithubConfig;

/// Resolves the latest commit of a branch on the remote.
#[async_trait]
pub trait CommitLookup: Send + Sync {
    async fn latest_commit(&self, dataset: &DatasetEntry, branch: &str) -> RegistryResult<String>;
}

#[derive(Deserialize)]
struct CommitResponse {
    sha: String,
}

/// `GET {api_base}/repos/{repo_id}/commits/{branch}` on the GitHub API.
pub struct GithubCommitLookup {
    http: reqwest::Client,
    api_base: String,
    auth: Arc<GithubAuth>,
    timeout: Duration,
}

impl GithubCommitLookup {
    pub fn new(config: &GithubConfig, auth: Arc<GithubAuth>) -> RegistryResult<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .user_agent(concat!("waffle/", env!("CARGO_PKG_VERSION")))
                .build()?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            auth,
            timeout: config.commit_lookup_timeout(),
        })
    }

    async fn fetch(&self, dataset: &DatasetEntry, branch: &str) -> RegistryResult<String> {
        let url = format!("{}/repos/{}/commits/{branch}", self.api_base, dataset.repo_id);
        let mut request = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");
        if let Some(token) = self
            .auth
            .token_for(dataset.fetcher_identity.as_deref())
            .await?
        {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Upstream {
                url,
                status: status.as_u16(),
                body,
            });
        }
        let commit: CommitResponse = response.json().await?;
        if commit.sha.is_empty() {
            return Err(RegistryError::NotFound(format!(
                "no commit for {}/{branch}",
                dataset.repo_id
            )));
        }
        Ok(commit.sha)
    }
}

#[async_trait]
impl CommitLookup for GithubCommitLookup {
    async fn latest_commit(&self, dataset: &DatasetEntry, branch: &str) -> RegistryResult<String> {
        // The bound covers token exchange and the lookup itself.
        match tokio::time::timeout(self.timeout, self.fetch(dataset, branch)).await {
            Ok(result) => result,
            Err(_) => Err(RegistryError::Timeout(self.timeout)),
        }
    }
}
