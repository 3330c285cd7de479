//! Startup wiring and background tasks.

use crate::ledger::{HOURLY_BACKUP_NAME, LedgerError};
use crate::reader::DatapackageFactory;
use crate::state::{AppState, Collaborators};
use crate::sync::{SyncAuthority, SyncScope};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use waffle_core::config::AppConfig;
use waffle_git::CliGit;
use waffle_registry::{GithubAuth, GithubCommitLookup};

/// Base period of the event backup schedule.
pub const BACKUP_PERIOD: Duration = Duration::from_secs(3600);

/// Production integrations: the configured control source, GitHub for
/// commit lookups and the system `git` binary.
pub async fn collaborators_from_config(config: &AppConfig) -> Result<Collaborators> {
    let source = waffle_registry::source::from_config(&config.control)
        .context("failed to initialize control source")?;
    if source.is_none() {
        tracing::warn!("No control source configured, serving backed up tables only");
    }

    let auth = Arc::new(
        GithubAuth::from_config(&config.github).context("invalid GitHub credentials")?,
    );
    let commits = GithubCommitLookup::new(&config.github, auth.clone())
        .context("failed to initialize commit lookup")?;

    CliGit::ensure_available()
        .await
        .context("git is required to materialize datasets")?;

    Ok(Collaborators {
        source,
        commits: Arc::new(commits),
        git: Arc::new(CliGit::new(auth)),
        readers: Arc::new(DatapackageFactory),
    })
}

/// Bring the state up before accepting requests.
///
/// Fails if the access control tables can be neither fetched nor restored
/// from a backup.
pub async fn initialize(state: &AppState) -> Result<()> {
    let report = state
        .registry
        .load_initial()
        .await
        .context("failed to load control tables")?;
    tracing::info!(?report, "Control tables loaded");
    state.access.reload(&state.registry.current());

    if state.config.events.restore_on_startup {
        match state.ledger.restore(HOURLY_BACKUP_NAME).await {
            Ok(count) => tracing::info!(records = count, "Events restored from hourly backup"),
            Err(LedgerError::NotFound(_)) => tracing::info!("No hourly event backup to restore"),
            Err(e) => tracing::warn!(error = %e, "Failed to restore events, starting empty"),
        }
    }

    state.sync.load_from_disk().await;

    if state.config.sync.sync_on_startup {
        state
            .sync
            .sync_if_not_already_syncing(SyncScope::All, SyncAuthority::System);
    }
    Ok(())
}

/// Spawn the event backup schedule and periodic syncs, as configured.
pub fn spawn_background_tasks(state: &AppState) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    if state.config.events.backup_schedule_enabled {
        handles.push(state.ledger.clone().spawn_scheduler(BACKUP_PERIOD));
        tracing::info!("Event backup schedule enabled");
    } else {
        tracing::info!("Event backup schedule disabled");
    }

    if let Some(period) = state.config.sync.auto_sync_interval() {
        let sync = state.sync.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                sync.sync_if_not_already_syncing(SyncScope::All, SyncAuthority::System);
            }
        }));
        tracing::info!(interval_secs = period.as_secs(), "Periodic sync enabled");
    }

    handles
}
