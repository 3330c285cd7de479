use std::path::PathBuf;
use waffle_core::DatasetEntry;

/// A public dataset tracking `branches`.
#[allow(dead_code)]
pub fn dataset(slug: &str, repo_id: &str, branches: &[&str]) -> DatasetEntry {
    DatasetEntry {
        slug: slug.to_string(),
        repo_id: repo_id.to_string(),
        branches: branches.iter().map(|b| b.to_string()).collect(),
        default_branch: None,
        is_private: false,
        fetcher_identity: None,
    }
}

#[allow(dead_code)]
pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}
