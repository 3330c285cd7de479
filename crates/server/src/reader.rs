//! Query-engine seam and the reader handle table.
//!
//! A reader is bound to one on-disk (dataset, branch) working copy. The sync
//! orchestrator builds a fresh reader after every successful checkout and
//! swaps it into the [`ReaderTable`]; requests keep using the previous reader
//! until the swap happens.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use waffle_core::{DatasetControlList, DatasetEntry};

/// File describing a dataset working copy.
pub const DATAPACKAGE_FILE: &str = "datapackage.json";

/// Query engine errors.
#[derive(Debug, Error)]
pub enum ReaderError {
    /// The query is well-formed but the engine refuses it.
    #[error("{0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("reader unavailable: {0}")]
    Unavailable(String),
}

pub type ReaderResult<T> = std::result::Result<T, ReaderError>;

/// Query engine bound to one working copy.
#[async_trait]
pub trait DatasetReader: Send + Sync {
    /// Dataset metadata.
    async fn info(&self) -> ReaderResult<Value>;

    /// Answer a parsed query.
    async fn read(&self, query: &Value) -> ReaderResult<Value>;
}

/// Builds readers for freshly synced working copies.
#[async_trait]
pub trait ReaderFactory: Send + Sync {
    async fn open(
        &self,
        dataset: &DatasetEntry,
        branch: &str,
        dir: &Path,
    ) -> ReaderResult<Arc<dyn DatasetReader>>;
}

type BranchReaders = HashMap<String, Arc<dyn DatasetReader>>;

/// `slug -> branch -> reader`.
#[derive(Default)]
pub struct ReaderTable {
    inner: RwLock<HashMap<String, BranchReaders>>,
}

impl ReaderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, slug: &str, branch: &str) -> Option<Arc<dyn DatasetReader>> {
        let lookup = |map: &HashMap<String, BranchReaders>| {
            map.get(slug).and_then(|branches| branches.get(branch)).cloned()
        };
        match self.inner.read() {
            Ok(guard) => lookup(&guard),
            Err(poisoned) => lookup(&poisoned.into_inner()),
        }
    }

    /// Replace the reader of `slug/branch`.
    pub fn install(&self, slug: &str, branch: &str, reader: Arc<dyn DatasetReader>) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .entry(slug.to_string())
            .or_default()
            .insert(branch.to_string(), reader);
    }

    /// Drop readers of datasets and branches no longer listed.
    pub fn retain_listed(&self, datasets: &DatasetControlList) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.retain(|slug, branches| match datasets.get(slug) {
            Some(dataset) => {
                branches.retain(|branch, _| dataset.has_branch(branch));
                !branches.is_empty()
            }
            None => false,
        });
    }

    /// Number of installed readers.
    pub fn count(&self) -> usize {
        let count = |map: &HashMap<String, BranchReaders>| map.values().map(HashMap::len).sum();
        match self.inner.read() {
            Ok(guard) => count(&guard),
            Err(poisoned) => count(&poisoned.into_inner()),
        }
    }
}

/// Reader answering metadata and schema queries from `datapackage.json`.
pub struct DatapackageReader {
    dir: PathBuf,
    package: Value,
}

impl DatapackageReader {
    /// Load the datapackage of `dir`.
    pub async fn load(dir: &Path) -> ReaderResult<Self> {
        let data = tokio::fs::read(dir.join(DATAPACKAGE_FILE)).await?;
        let package: Value = serde_json::from_slice(&data)?;
        if !package.is_object() {
            return Err(ReaderError::Unavailable(format!(
                "{} in {} is not a JSON object",
                DATAPACKAGE_FILE,
                dir.display()
            )));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            package,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Schema rows of one `ddfSchema` collection.
    fn schema_rows(&self, collection: &str) -> Vec<Value> {
        self.package["ddfSchema"][collection]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| json!([entry["primaryKey"], entry["value"]]))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl DatasetReader for DatapackageReader {
    async fn info(&self) -> ReaderResult<Value> {
        Ok(self.package.clone())
    }

    async fn read(&self, query: &Value) -> ReaderResult<Value> {
        let from = query["from"]
            .as_str()
            .ok_or_else(|| ReaderError::Validation("Query must have a \"from\" clause".to_string()))?;

        let rows = match from.strip_suffix(".schema") {
            Some("*") => ["concepts", "entities", "datapoints"]
                .iter()
                .flat_map(|collection| self.schema_rows(collection))
                .collect(),
            Some(collection @ ("concepts" | "entities" | "datapoints")) => {
                self.schema_rows(collection)
            }
            _ => {
                return Err(ReaderError::Validation(format!(
                    "Queries from \"{from}\" are not supported by this reader"
                )));
            }
        };

        Ok(json!({
            "header": ["key", "value"],
            "rows": rows,
        }))
    }
}

/// Opens a [`DatapackageReader`] per working copy.
#[derive(Clone, Copy, Debug, Default)]
pub struct DatapackageFactory;

#[async_trait]
impl ReaderFactory for DatapackageFactory {
    async fn open(
        &self,
        dataset: &DatasetEntry,
        branch: &str,
        dir: &Path,
    ) -> ReaderResult<Arc<dyn DatasetReader>> {
        let reader = DatapackageReader::load(dir).await?;
        tracing::debug!(slug = %dataset.slug, branch = %branch, dir = %dir.display(), "Reader opened");
        Ok(Arc::new(reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package() -> Value {
        json!({
            "name": "ds1",
            "ddfSchema": {
                "concepts": [{"primaryKey": ["concept"], "value": "concept_type"}],
                "entities": [{"primaryKey": ["geo"], "value": "name"}],
                "datapoints": [
                    {"primaryKey": ["geo", "time"], "value": "population"},
                    {"primaryKey": ["geo", "time"], "value": "gdp"}
                ]
            }
        })
    }

    async fn reader() -> (tempfile::TempDir, DatapackageReader) {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join(DATAPACKAGE_FILE),
            serde_json::to_vec(&package()).unwrap(),
        )
        .await
        .unwrap();
        let reader = DatapackageReader::load(dir.path()).await.unwrap();
        (dir, reader)
    }

    #[tokio::test]
    async fn test_info_returns_datapackage() {
        let (_dir, reader) = reader().await;
        assert_eq!(reader.info().await.unwrap()["name"], "ds1");
    }

    #[tokio::test]
    async fn test_schema_queries() {
        let (_dir, reader) = reader().await;

        let result = reader
            .read(&json!({"from": "datapoints.schema"}))
            .await
            .unwrap();
        assert_eq!(result["rows"].as_array().unwrap().len(), 2);
        assert_eq!(result["rows"][0], json!([["geo", "time"], "population"]));

        let all = reader.read(&json!({"from": "*.schema"})).await.unwrap();
        assert_eq!(all["rows"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_other_queries_are_validation_errors() {
        let (_dir, reader) = reader().await;
        let err = reader.read(&json!({"from": "entities"})).await.unwrap_err();
        assert!(matches!(err, ReaderError::Validation(_)));
        let err = reader.read(&json!({"select": {}})).await.unwrap_err();
        assert!(matches!(err, ReaderError::Validation(_)));
    }

    #[tokio::test]
    async fn test_missing_datapackage() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            DatapackageReader::load(dir.path()).await,
            Err(ReaderError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_table_install_and_retain() {
        let (_dir, reader) = reader().await;
        let reader: Arc<dyn DatasetReader> = Arc::new(reader);
        let table = ReaderTable::new();
        table.install("ds1", "master", reader.clone());
        table.install("ds1", "gone", reader.clone());
        table.install("ds2", "master", reader);
        assert_eq!(table.count(), 3);

        let list = DatasetControlList::new(vec![DatasetEntry {
            slug: "ds1".to_string(),
            repo_id: "acme/ds1".to_string(),
            branches: vec!["master".to_string()],
            default_branch: None,
            is_private: false,
            fetcher_identity: None,
        }]);
        table.retain_listed(&list);
        assert_eq!(table.count(), 1);
        assert!(table.get("ds1", "master").is_some());
        assert!(table.get("ds2", "master").is_none());
    }
}
