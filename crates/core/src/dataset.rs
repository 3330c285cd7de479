//! Dataset control entries and branch/commit bookkeeping.

use crate::COMMIT_ABBREV_LEN;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Latest known commit per branch of one dataset.
pub type BranchCommits = BTreeMap<String, String>;

/// One row of the dataset control list.
///
/// Immutable once loaded; the whole list is replaced on every refresh.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetEntry {
    /// External identifier used in URLs.
    pub slug: String,
    /// Repository identifier in `owner/name` form.
    #[serde(alias = "githubRepoId", alias = "github_repo_id")]
    pub repo_id: String,
    /// Branches tracked for this dataset.
    pub branches: Vec<String>,
    /// Branch served when a request names none.
    #[serde(default)]
    pub default_branch: Option<String>,
    /// Private datasets require dataset-level access.
    #[serde(default)]
    pub is_private: bool,
    /// Identity used to fetch the repository (a GitHub App installation id).
    #[serde(default)]
    pub fetcher_identity: Option<String>,
}

impl DatasetEntry {
    /// The effective default branch: the configured one, else the first tracked branch.
    pub fn default_branch(&self) -> Option<&str> {
        self.default_branch
            .as_deref()
            .filter(|b| !b.is_empty())
            .or_else(|| self.branches.first().map(String::as_str))
    }

    /// Whether `branch` is tracked for this dataset.
    pub fn has_branch(&self, branch: &str) -> bool {
        self.branches.iter().any(|b| b == branch)
    }

    /// Repository owner (the part of `repo_id` before the slash).
    pub fn owner(&self) -> &str {
        self.repo_id.split('/').next().unwrap_or_default()
    }

    /// Repository name (the part of `repo_id` after the slash).
    pub fn repo_name(&self) -> &str {
        self.repo_id.split('/').nth(1).unwrap_or_default()
    }

    /// Check the invariants the rest of the system relies on.
    pub fn validate(&self) -> crate::Result<()> {
        validate_slug(&self.slug)?;
        validate_repo_id(&self.repo_id)?;
        for branch in &self.branches {
            validate_branch(branch)?;
        }
        Ok(())
    }
}

/// Dataset control list snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetControlList {
    entries: Vec<DatasetEntry>,
}

impl DatasetControlList {
    pub fn new(entries: Vec<DatasetEntry>) -> Self {
        Self { entries }
    }

    /// Look up a dataset by slug.
    pub fn get(&self, slug: &str) -> Option<&DatasetEntry> {
        self.entries.iter().find(|e| e.slug == slug)
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.get(slug).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DatasetEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[DatasetEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Comma-separated slugs, for status messages.
    pub fn slug_list(&self) -> String {
        self.entries
            .iter()
            .map(|e| e.slug.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Shorten a commit hash to the canonical URL form.
pub fn abbreviate_commit(commit: &str) -> &str {
    match commit.char_indices().nth(COMMIT_ABBREV_LEN) {
        Some((idx, _)) => &commit[..idx],
        None => commit,
    }
}

/// Whether two commit references name the same commit.
///
/// Either side may be a full hash or its abbreviation.
pub fn commits_match(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || abbreviate_commit(a) == b || abbreviate_commit(b) == a
}

/// Slugs are lowercase ASCII letters, digits, `-` and `_`.
pub fn validate_slug(slug: &str) -> crate::Result<()> {
    let valid = !slug.is_empty()
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(crate::Error::InvalidSlug(slug.to_string()))
    }
}

/// Repository ids are `owner/name`, each a single safe path component.
pub fn validate_repo_id(repo_id: &str) -> crate::Result<()> {
    let mut parts = repo_id.split('/');
    let valid = match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) => is_safe_component(owner) && is_safe_component(name),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(crate::Error::InvalidRepoId(repo_id.to_string()))
    }
}

/// Branch names become directory names, so they must be a single safe path component.
pub fn validate_branch(branch: &str) -> crate::Result<()> {
    if is_safe_component(branch) {
        Ok(())
    } else {
        Err(crate::Error::InvalidBranch(branch.to_string()))
    }
}

fn is_safe_component(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> DatasetEntry {
        DatasetEntry {
            slug: "ds1".to_string(),
            repo_id: "open-numbers/ddf--ds1".to_string(),
            branches: vec!["master".to_string(), "dev".to_string()],
            default_branch: None,
            is_private: false,
            fetcher_identity: None,
        }
    }

    #[test]
    fn test_abbreviate_commit() {
        assert_eq!(abbreviate_commit("abcdef1234"), "abcdef1");
        assert_eq!(abbreviate_commit("abcdef1"), "abcdef1");
        assert_eq!(abbreviate_commit("abc"), "abc");
    }

    #[test]
    fn test_commits_match_symmetric() {
        let full = "abcdef1234567890";
        assert!(commits_match(full, full));
        assert!(commits_match(full, "abcdef1"));
        assert!(commits_match("abcdef1", full));
        assert!(!commits_match(full, "abcdef2"));
        assert!(!commits_match(full, "abcdef"));
        assert!(!commits_match(full, ""));
        assert!(!commits_match("", ""));
    }

    #[test]
    fn test_default_branch_falls_back_to_first() {
        let mut e = entry();
        assert_eq!(e.default_branch(), Some("master"));

        e.default_branch = Some("dev".to_string());
        assert_eq!(e.default_branch(), Some("dev"));

        e.default_branch = Some(String::new());
        assert_eq!(e.default_branch(), Some("master"));

        e.branches.clear();
        e.default_branch = None;
        assert_eq!(e.default_branch(), None);
    }

    #[test]
    fn test_owner_and_repo_name() {
        let e = entry();
        assert_eq!(e.owner(), "open-numbers");
        assert_eq!(e.repo_name(), "ddf--ds1");
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_traversal() {
        assert!(validate_repo_id("../etc").is_err());
        assert!(validate_repo_id("owner/..").is_err());
        assert!(validate_repo_id("owner/name/extra").is_err());
        assert!(validate_repo_id("owner").is_err());
        assert!(validate_branch("..").is_err());
        assert!(validate_branch("feature/x").is_err());
        assert!(validate_slug("Fasttrack").is_err());
        assert!(validate_slug("sg-master_2").is_ok());
    }

    #[test]
    fn test_deserialize_legacy_field_names() {
        let json = r#"[{"slug": "fasttrack", "githubRepoId": "open-numbers/ddf--gapminder--fasttrack", "branches": ["master"], "default_branch": "master", "is_private": false}]"#;
        let list: DatasetControlList = serde_json::from_str(json).unwrap();
        assert_eq!(list.len(), 1);
        let e = list.get("fasttrack").unwrap();
        assert_eq!(e.repo_id, "open-numbers/ddf--gapminder--fasttrack");
        assert_eq!(e.fetcher_identity, None);
        assert!(list.get("missing").is_none());
    }
}
