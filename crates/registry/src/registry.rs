//! Refreshable control list and ACL read model with snapshot fallback.

use crate::error::{RegistryError, RegistryResult};
use crate::snapshot::SnapshotStore;
use crate::source::ControlSource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::{Arc, RwLock};
use waffle_core::{AccessControlRow, DatasetControlList};

pub const DATASETS_SNAPSHOT: &str = "dataset-control-list";
pub const USER_ACL_SNAPSHOT: &str = "acl-users";
pub const PERMALINK_ACL_SNAPSHOT: &str = "acl-permalinks";

/// One consistent view of the control tables.
#[derive(Clone, Debug, Default)]
pub struct ControlSnapshot {
    pub datasets: DatasetControlList,
    pub user_acl: Vec<AccessControlRow>,
    pub permalink_acl: Vec<AccessControlRow>,
}

/// Where a table in the current view came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Freshly fetched from the control source.
    Source,
    /// Loaded from the last persisted snapshot.
    Snapshot,
    /// Neither was available; the previous in-memory table was kept.
    Memory,
}

/// Result of a refresh, per table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub datasets: Origin,
    pub user_acl: Origin,
    pub permalink_acl: Origin,
}

impl RefreshReport {
    pub fn fully_fresh(&self) -> bool {
        self.datasets == Origin::Source
            && self.user_acl == Origin::Source
            && self.permalink_acl == Origin::Source
    }
}

/// Control registry: fetches from the source, persists snapshots and falls
/// back to them when the source is unavailable.
pub struct ControlRegistry {
    source: Option<Box<dyn ControlSource>>,
    snapshots: SnapshotStore,
    current: RwLock<Arc<ControlSnapshot>>,
}

impl ControlRegistry {
    /// `source == None` serves snapshots only.
    pub fn new(source: Option<Box<dyn ControlSource>>, snapshots: SnapshotStore) -> Self {
        Self {
            source,
            snapshots,
            current: RwLock::new(Arc::new(ControlSnapshot::default())),
        }
    }

    /// The current view. Cheap to clone, never blocks on a refresh.
    pub fn current(&self) -> Arc<ControlSnapshot> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Current dataset control list.
    pub fn datasets(&self) -> DatasetControlList {
        self.current().datasets.clone()
    }

    fn swap(&self, snapshot: ControlSnapshot) {
        let snapshot = Arc::new(snapshot);
        match self.current.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    /// Refresh every table, falling back per table to the snapshot and then
    /// to the in-memory copy.
    pub async fn refresh(&self) -> RegistryResult<RefreshReport> {
        let previous = self.current();
        let source = self.source.as_deref();

        let (datasets, datasets_origin) = self
            .load_table(
                DATASETS_SNAPSHOT,
                source.map(|s| s.fetch_datasets()),
                previous.datasets.clone(),
            )
            .await;
        let (user_acl, user_origin) = self
            .load_table(
                USER_ACL_SNAPSHOT,
                source.map(|s| s.fetch_user_acl()),
                previous.user_acl.clone(),
            )
            .await;
        let (permalink_acl, permalink_origin) = self
            .load_table(
                PERMALINK_ACL_SNAPSHOT,
                source.map(|s| s.fetch_permalink_acl()),
                previous.permalink_acl.clone(),
            )
            .await;

        tracing::info!(
            datasets = datasets.len(),
            user_acl = user_acl.len(),
            permalink_acl = permalink_acl.len(),
            "Control tables refreshed"
        );

        self.swap(ControlSnapshot {
            datasets,
            user_acl,
            permalink_acl,
        });

        Ok(RefreshReport {
            datasets: datasets_origin,
            user_acl: user_origin,
            permalink_acl: permalink_origin,
        })
    }

    /// First load at startup.
    ///
    /// Refuses to proceed when either ACL table is neither fetchable nor
    /// snapshotted, so the server never runs without access control.
    pub async fn load_initial(&self) -> RegistryResult<RefreshReport> {
        let report = self.refresh().await?;
        for (name, origin) in [
            (USER_ACL_SNAPSHOT, report.user_acl),
            (PERMALINK_ACL_SNAPSHOT, report.permalink_acl),
        ] {
            if origin == Origin::Memory {
                return Err(RegistryError::NotFound(format!(
                    "access control table {name} is unavailable and has no snapshot in {}",
                    self.snapshots.dir().display()
                )));
            }
        }
        if report.datasets == Origin::Memory {
            tracing::warn!("Dataset control list is unavailable and has no snapshot; starting empty");
        }
        Ok(report)
    }

    async fn load_table<T, F>(&self, name: &str, fetch: Option<F>, previous: T) -> (T, Origin)
    where
        T: Serialize + DeserializeOwned,
        F: Future<Output = RegistryResult<T>>,
    {
        if let Some(fetch) = fetch {
            match fetch.await {
                Ok(value) => {
                    if let Err(e) = self.snapshots.write_json(name, &value).await {
                        tracing::warn!(table = name, error = %e, "Failed to persist snapshot");
                    }
                    return (value, Origin::Source);
                }
                Err(e) => {
                    tracing::warn!(table = name, error = %e, "Control source unavailable, falling back to snapshot");
                }
            }
        }

        match self.snapshots.read_json::<T>(name).await {
            Ok(Some(value)) => {
                tracing::info!(table = name, "Loaded table from snapshot");
                (value, Origin::Snapshot)
            }
            Ok(None) => {
                tracing::warn!(table = name, "No snapshot found, keeping in-memory table");
                (previous, Origin::Memory)
            }
            Err(e) => {
                tracing::error!(table = name, error = %e, "Failed to read snapshot, keeping in-memory table");
                (previous, Origin::Memory)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticSource;
    use waffle_core::{AccessLevel, DatasetEntry};

    fn list(slugs: &[&str]) -> DatasetControlList {
        DatasetControlList::new(
            slugs
                .iter()
                .map(|slug| DatasetEntry {
                    slug: slug.to_string(),
                    repo_id: format!("acme/{slug}"),
                    branches: vec!["master".to_string()],
                    default_branch: None,
                    is_private: false,
                    fetcher_identity: None,
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_refresh_persists_and_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(StaticSource::new(
            list(&["ds1", "ds2"]),
            vec![AccessControlRow::dataset("u1", "ds1", AccessLevel::Reader)],
            Vec::new(),
        ));

        let registry = ControlRegistry::new(
            Some(Box::new(source.clone())),
            SnapshotStore::new(dir.path()),
        );
        let report = registry.load_initial().await.unwrap();
        assert!(report.fully_fresh());
        assert_eq!(registry.datasets().len(), 2);

        // Source goes away: a fresh registry recovers from the snapshots.
        source.set_unavailable(true);
        let recovered = ControlRegistry::new(
            Some(Box::new(source.clone())),
            SnapshotStore::new(dir.path()),
        );
        let report = recovered.load_initial().await.unwrap();
        assert_eq!(report.datasets, Origin::Snapshot);
        assert_eq!(report.user_acl, Origin::Snapshot);
        assert_eq!(recovered.datasets().slug_list(), "ds1, ds2");
        assert_eq!(recovered.current().user_acl.len(), 1);
    }

    #[tokio::test]
    async fn test_load_initial_refuses_without_acl() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ControlRegistry::new(None, SnapshotStore::new(dir.path()));
        assert!(registry.load_initial().await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_only_registry() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.write_json(DATASETS_SNAPSHOT, &list(&["ds1"])).await.unwrap();
        store
            .write_json(USER_ACL_SNAPSHOT, &Vec::<AccessControlRow>::new())
            .await
            .unwrap();
        store
            .write_json(PERMALINK_ACL_SNAPSHOT, &Vec::<AccessControlRow>::new())
            .await
            .unwrap();

        let registry = ControlRegistry::new(None, store);
        let report = registry.load_initial().await.unwrap();
        assert_eq!(report.datasets, Origin::Snapshot);
        assert!(registry.datasets().contains("ds1"));
    }
}
