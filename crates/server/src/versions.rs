//! Branch-commit map: the latest synced commit of every (dataset, branch).

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use waffle_core::{BranchCommits, DatasetControlList};

/// `slug -> branch -> commit`.
///
/// Written only by the sync orchestrator once a checkout succeeded, read by
/// every request. A slug without an entry has never been synced.
#[derive(Debug, Default)]
pub struct VersionMap {
    inner: RwLock<HashMap<String, BranchCommits>>,
}

impl VersionMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<String, BranchCommits>) -> T) -> T {
        match self.inner.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn write<T>(&self, f: impl FnOnce(&mut HashMap<String, BranchCommits>) -> T) -> T {
        match self.inner.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Synced branches of `slug`, or `None` if it was never synced.
    pub fn branches(&self, slug: &str) -> Option<BranchCommits> {
        self.read(|map| map.get(slug).cloned())
    }

    pub fn commit(&self, slug: &str, branch: &str) -> Option<String> {
        self.read(|map| map.get(slug).and_then(|b| b.get(branch)).cloned())
    }

    /// Record `commit` as the served commit of `slug/branch`.
    pub fn publish(&self, slug: &str, branch: &str, commit: &str) {
        self.write(|map| {
            map.entry(slug.to_string())
                .or_default()
                .insert(branch.to_string(), commit.to_string());
        });
    }

    /// Forget datasets and branches the control list no longer mentions.
    pub fn retain_listed(&self, datasets: &DatasetControlList) {
        self.write(|map| {
            map.retain(|slug, branches| match datasets.get(slug) {
                Some(dataset) => {
                    branches.retain(|branch, _| dataset.has_branch(branch));
                    !branches.is_empty()
                }
                None => false,
            });
        });
    }

    /// Copy of the whole map, ordered by slug.
    pub fn snapshot(&self) -> BTreeMap<String, BranchCommits> {
        self.read(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Number of datasets with at least one synced branch.
    pub fn len(&self) -> usize {
        self.read(HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
