//! Application state shared across handlers.

use crate::access::AccessResolver;
use crate::ledger::EventLedger;
use crate::reader::{ReaderFactory, ReaderTable};
use crate::sync::{SyncOrchestrator, SyncParts};
use crate::versions::VersionMap;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use waffle_core::config::AppConfig;
use waffle_git::{GitBackend, WorkerConfig, WorkerHandle};
use waffle_registry::{CommitLookup, ControlRegistry, ControlSource, SnapshotStore};

/// Outside-world integrations, swapped for fakes in tests.
pub struct Collaborators {
    /// `None` serves only the tables already in the backup directory.
    pub source: Option<Box<dyn ControlSource>>,
    pub commits: Arc<dyn CommitLookup>,
    pub git: Arc<dyn GitBackend>,
    pub readers: Arc<dyn ReaderFactory>,
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ControlRegistry>,
    pub access: Arc<AccessResolver>,
    pub versions: Arc<VersionMap>,
    pub readers: Arc<ReaderTable>,
    pub ledger: Arc<EventLedger>,
    pub sync: Arc<SyncOrchestrator>,
    pub worker: WorkerHandle,
    pub live_since: OffsetDateTime,
    started: Instant,
}

impl AppState {
    /// Wire up the state and spawn the git worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: AppConfig, collaborators: Collaborators) -> Self {
        let snapshots = SnapshotStore::new(config.server.backup_dir.clone());
        let registry = Arc::new(ControlRegistry::new(
            collaborators.source,
            snapshots.clone(),
        ));
        let access = Arc::new(AccessResolver::new(
            config.server.server_id.clone(),
            config.auth.anonymous_server_level,
        ));
        let versions = Arc::new(VersionMap::new());
        let readers = Arc::new(ReaderTable::new());
        let worker = WorkerHandle::spawn(
            collaborators.git.clone(),
            WorkerConfig::from_sync_config(&config.sync),
        );

        let sync = Arc::new(SyncOrchestrator::new(
            SyncParts {
                registry: registry.clone(),
                access: access.clone(),
                commits: collaborators.commits,
                backend: collaborators.git,
                worker: worker.clone(),
                versions: versions.clone(),
                readers: readers.clone(),
                factory: collaborators.readers,
            },
            &config,
        ));

        Self {
            config: Arc::new(config),
            registry,
            access,
            versions,
            readers,
            ledger: Arc::new(EventLedger::new(snapshots)),
            sync,
            worker,
            live_since: OffsetDateTime::now_utc(),
            started: Instant::now(),
        }
    }

    /// Prefix for links in error hints.
    pub fn base_url(&self) -> &str {
        self.config
            .server
            .public_base_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .unwrap_or_default()
    }

    pub fn uptime_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}
