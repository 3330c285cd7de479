//! On-disk layout of dataset working copies: `{root}/{owner}/{repo}/{branch}`.

use crate::error::GitResult;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use waffle_core::{DatasetControlList, DatasetEntry};

/// Paths of dataset working copies.
#[derive(Clone, Debug)]
pub struct DatasetLayout {
    root: PathBuf,
    marker: String,
}

impl DatasetLayout {
    /// `marker` is the file whose presence marks a completed clone.
    pub fn new(root: impl Into<PathBuf>, marker: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            marker: marker.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_dir(&self, dataset: &DatasetEntry) -> PathBuf {
        self.root.join(dataset.owner()).join(dataset.repo_name())
    }

    pub fn branch_dir(&self, dataset: &DatasetEntry, branch: &str) -> PathBuf {
        self.repo_dir(dataset).join(branch)
    }

    pub fn marker_path(&self, dataset: &DatasetEntry, branch: &str) -> PathBuf {
        self.branch_dir(dataset, branch).join(&self.marker)
    }

    /// Whether the branch has been cloned.
    pub async fn is_materialized(&self, dataset: &DatasetEntry, branch: &str) -> bool {
        fs::try_exists(self.marker_path(dataset, branch))
            .await
            .unwrap_or(false)
    }

    /// Remove owner, repository and branch directories that the control list
    /// no longer mentions. Directories of listed branches are never touched.
    ///
    /// Returns the removed paths.
    pub async fn cleanup(&self, datasets: &DatasetControlList) -> GitResult<Vec<PathBuf>> {
        // owner -> repo -> branches; several slugs may share one repository
        let mut wanted: BTreeMap<&str, BTreeMap<&str, BTreeSet<&str>>> = BTreeMap::new();
        for dataset in datasets.iter() {
            let branches = wanted
                .entry(dataset.owner())
                .or_default()
                .entry(dataset.repo_name())
                .or_default();
            branches.extend(dataset.branches.iter().map(String::as_str));
        }

        let mut removed = Vec::new();
        if !fs::try_exists(&self.root).await? {
            return Ok(removed);
        }

        for owner_dir in list_dirs(&self.root).await? {
            let Some(repos) = dir_name(&owner_dir).and_then(|name| wanted.get(name.as_str()))
            else {
                remove_dir(&owner_dir, &mut removed).await?;
                continue;
            };
            for repo_dir in list_dirs(&owner_dir).await? {
                let Some(branches) = dir_name(&repo_dir).and_then(|name| repos.get(name.as_str()))
                else {
                    remove_dir(&repo_dir, &mut removed).await?;
                    continue;
                };
                for branch_dir in list_dirs(&repo_dir).await? {
                    let listed = dir_name(&branch_dir)
                        .is_some_and(|name| branches.contains(name.as_str()));
                    if !listed {
                        remove_dir(&branch_dir, &mut removed).await?;
                    }
                }
            }
        }
        Ok(removed)
    }
}

fn dir_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// Child directories of `dir`. Files and symlinks are left alone.
async fn list_dirs(dir: &Path) -> GitResult<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

async fn remove_dir(path: &Path, removed: &mut Vec<PathBuf>) -> GitResult<()> {
    tracing::info!(path = %path.display(), "Removing directory no longer in the control list");
    fs::remove_dir_all(path).await?;
    removed.push(path.to_path_buf());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(slug: &str, repo: &str, branches: &[&str]) -> DatasetEntry {
        DatasetEntry {
            slug: slug.to_string(),
            repo_id: repo.to_string(),
            branches: branches.iter().map(|b| b.to_string()).collect(),
            default_branch: None,
            is_private: false,
            fetcher_identity: None,
        }
    }

    #[tokio::test]
    async fn test_paths_and_marker() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DatasetLayout::new(dir.path(), "datapackage.json");
        let ds = entry("ds1", "acme/ddf--ds1", &["master"]);

        assert_eq!(
            layout.branch_dir(&ds, "master"),
            dir.path().join("acme").join("ddf--ds1").join("master")
        );
        assert!(!layout.is_materialized(&ds, "master").await);

        std::fs::create_dir_all(layout.branch_dir(&ds, "master")).unwrap();
        std::fs::write(layout.marker_path(&ds, "master"), "{}").unwrap();
        assert!(layout.is_materialized(&ds, "master").await);
    }

    #[tokio::test]
    async fn test_cleanup_on_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DatasetLayout::new(dir.path().join("absent"), "datapackage.json");
        let removed = layout.cleanup(&DatasetControlList::default()).await.unwrap();
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_branches_shared_by_two_slugs() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DatasetLayout::new(dir.path(), "datapackage.json");
        let a = entry("a", "acme/shared", &["master"]);
        let b = entry("b", "acme/shared", &["dev"]);
        for branch in ["master", "dev", "old"] {
            std::fs::create_dir_all(layout.branch_dir(&a, branch)).unwrap();
        }

        let removed = layout
            .cleanup(&DatasetControlList::new(vec![a.clone(), b]))
            .await
            .unwrap();
        assert_eq!(removed, vec![layout.branch_dir(&a, "old")]);
        assert!(layout.branch_dir(&a, "master").exists());
        assert!(layout.branch_dir(&a, "dev").exists());
    }
}
