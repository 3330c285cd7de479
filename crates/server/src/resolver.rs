//! Branch/commit resolver.
//!
//! Turns `(slug, branch?, commit?)` into one of three outcomes: an error, a
//! redirect to the canonical `{branch}/{abbreviated commit}` URL, or a
//! resolved version the handler can serve. Every outcome carries the
//! Cache-Control directive it must be sent with.

use crate::access::{AccessResolver, Requester};
use crate::error::ApiError;
use crate::versions::VersionMap;
use axum::Json;
use axum::http::header::{CACHE_CONTROL, LOCATION};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use waffle_core::config::CacheControlConfig;
use waffle_core::{BranchCommits, DatasetControlList, DatasetEntry, abbreviate_commit, commits_match};

/// Cache policy of a terminal response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheDirective {
    /// Errors.
    NoStore,
    /// Redirects: the target moves with every sync.
    Redirect,
    /// A resolved (slug, branch, commit) triple never changes.
    Immutable,
}

impl CacheDirective {
    pub fn header_value(&self, config: &CacheControlConfig) -> String {
        match self {
            Self::NoStore => crate::error::NO_STORE.to_string(),
            Self::Redirect => format!(
                "public, s-maxage={0}, max-age={0}",
                config.redirect_max_age_secs
            ),
            Self::Immutable => format!(
                "public, s-maxage={}, max-age={}",
                config.success_s_maxage_secs, config.success_max_age_secs
            ),
        }
    }
}

/// Terminal outcome of a dataset request.
#[derive(Debug)]
pub enum Outcome {
    Error(ApiError),
    Redirect {
        location: String,
        cache: CacheDirective,
    },
    Success {
        body: Value,
        cache: CacheDirective,
    },
}

impl Outcome {
    pub fn success(body: Value) -> Self {
        Self::Success {
            body,
            cache: CacheDirective::Immutable,
        }
    }

    pub fn redirect(location: String) -> Self {
        Self::Redirect {
            location,
            cache: CacheDirective::Redirect,
        }
    }

    pub fn cache(&self) -> CacheDirective {
        match self {
            Self::Error(_) => CacheDirective::NoStore,
            Self::Redirect { cache, .. } | Self::Success { cache, .. } => *cache,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Error(e) => e.status_code(),
            Self::Redirect { .. } => StatusCode::FOUND,
            Self::Success { .. } => StatusCode::OK,
        }
    }

    /// Build the HTTP response. `base_url` prefixes links in error hints.
    pub fn render(self, config: &CacheControlConfig, base_url: &str) -> Response {
        let cache = self.cache().header_value(config);
        let mut response = match self {
            Self::Error(e) => return e.into_response_with_base(base_url),
            Self::Redirect { location, .. } => {
                let mut response = StatusCode::FOUND.into_response();
                match HeaderValue::from_str(&location) {
                    Ok(value) => {
                        response.headers_mut().insert(LOCATION, value);
                    }
                    Err(_) => {
                        return ApiError::Internal(format!("invalid redirect target: {location}"))
                            .into_response_with_base(base_url);
                    }
                }
                response
            }
            Self::Success { body, .. } => (StatusCode::OK, Json(body)).into_response(),
        };
        if let Ok(value) = HeaderValue::from_str(&cache) {
            response.headers_mut().insert(CACHE_CONTROL, value);
        }
        response
    }
}

/// Why resolution stopped short of a servable version.
#[derive(Debug)]
pub enum Detour {
    Error(ApiError),
    Redirect(String),
}

impl From<ApiError> for Detour {
    fn from(e: ApiError) -> Self {
        Self::Error(e)
    }
}

impl From<Detour> for Outcome {
    fn from(detour: Detour) -> Self {
        match detour {
            Detour::Error(e) => Self::Error(e),
            Detour::Redirect(location) => Self::redirect(location),
        }
    }
}

/// Shape of the canonical URL: `{prefix}{branch}/{commit}{suffix}[?{query}]`.
#[derive(Clone, Debug)]
pub struct RedirectShape {
    pub prefix: String,
    pub suffix: String,
    /// Raw query string, reused verbatim.
    pub query: String,
}

impl RedirectShape {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: String::new(),
            query: String::new(),
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn with_query(mut self, query: Option<&str>) -> Self {
        self.query = query.unwrap_or_default().to_string();
        self
    }

    pub fn location(&self, branch: &str, commit: &str) -> String {
        let mut location = format!(
            "{}{}/{}{}",
            self.prefix,
            branch,
            abbreviate_commit(commit),
            self.suffix
        );
        if !self.query.is_empty() {
            location.push('?');
            location.push_str(&self.query);
        }
        location
    }
}

/// A configured, synced dataset the requester may read.
#[derive(Clone, Debug)]
pub struct Located {
    pub dataset: DatasetEntry,
    pub branches: BranchCommits,
}

/// A servable (dataset, branch, commit).
#[derive(Clone, Debug)]
pub struct ResolvedVersion {
    pub dataset: DatasetEntry,
    pub branch: String,
    /// Full hash of the synced commit.
    pub commit: String,
}

/// Resolution over the current control list and branch-commit map.
pub struct Resolver<'a> {
    pub datasets: &'a DatasetControlList,
    pub versions: &'a VersionMap,
    pub access: &'a AccessResolver,
}

impl Resolver<'_> {
    /// Dataset lookup: given, configured, synced and readable by `requester`.
    pub fn locate(&self, requester: &Requester, slug: Option<&str>) -> Result<Located, Detour> {
        let slug = slug.filter(|s| !s.is_empty()).ok_or(ApiError::NoDatasetGiven)?;
        let dataset = self
            .datasets
            .get(slug)
            .ok_or_else(|| ApiError::DatasetNotConfigured {
                slug: slug.to_string(),
            })?;
        let branches = self
            .versions
            .branches(slug)
            .ok_or_else(|| ApiError::DatasetNotFound {
                slug: slug.to_string(),
            })?;
        if !self.access.can_view(requester, dataset) {
            return Err(ApiError::DatasetUnauthorized {
                slug: slug.to_string(),
            }
            .into());
        }
        Ok(Located {
            dataset: dataset.clone(),
            branches,
        })
    }

    /// Branch and commit resolution on a located dataset.
    pub fn resolve_version(
        &self,
        located: Located,
        branch: Option<&str>,
        commit: Option<&str>,
        shape: &RedirectShape,
    ) -> Result<ResolvedVersion, Detour> {
        let Located { dataset, branches } = located;

        let synced_branch = branch.and_then(|b| branches.get_key_value(b));
        let Some((branch, current)) = synced_branch else {
            let default = dataset
                .default_branch()
                .and_then(|b| branches.get_key_value(b))
                .ok_or_else(|| ApiError::DefaultCommitNotResolved {
                    slug: dataset.slug.clone(),
                })?;
            return Err(Detour::Redirect(shape.location(default.0, default.1)));
        };

        match commit {
            Some(given) if commits_match(given, current) => Ok(ResolvedVersion {
                branch: branch.clone(),
                commit: current.clone(),
                dataset,
            }),
            _ => Err(Detour::Redirect(shape.location(branch, current))),
        }
    }

    /// [`Self::locate`] followed by [`Self::resolve_version`].
    pub fn resolve(
        &self,
        requester: &Requester,
        slug: Option<&str>,
        branch: Option<&str>,
        commit: Option<&str>,
        shape: &RedirectShape,
    ) -> Result<ResolvedVersion, Detour> {
        let located = self.locate(requester, slug)?;
        self.resolve_version(located, branch, commit, shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waffle_core::AccessLevel;

    const MASTER: &str = "abcdef1234567890";
    const DEV: &str = "0123456789abcdef";

    struct Fixture {
        datasets: DatasetControlList,
        versions: VersionMap,
        access: AccessResolver,
    }

    impl Fixture {
        fn new() -> Self {
            let datasets = DatasetControlList::new(vec![
                DatasetEntry {
                    slug: "ds1".to_string(),
                    repo_id: "acme/ds1".to_string(),
                    branches: vec!["master".to_string(), "dev".to_string()],
                    default_branch: Some("master".to_string()),
                    is_private: false,
                    fetcher_identity: None,
                },
                DatasetEntry {
                    slug: "unsynced".to_string(),
                    repo_id: "acme/unsynced".to_string(),
                    branches: vec!["master".to_string()],
                    default_branch: None,
                    is_private: false,
                    fetcher_identity: None,
                },
                DatasetEntry {
                    slug: "secret".to_string(),
                    repo_id: "acme/secret".to_string(),
                    branches: vec!["master".to_string()],
                    default_branch: None,
                    is_private: true,
                    fetcher_identity: None,
                },
            ]);
            let versions = VersionMap::new();
            versions.publish("ds1", "master", MASTER);
            versions.publish("ds1", "dev", DEV);
            versions.publish("secret", "master", MASTER);
            Self {
                datasets,
                versions,
                access: AccessResolver::new("small-waffle", Some(AccessLevel::Reader)),
            }
        }

        fn resolver(&self) -> Resolver<'_> {
            Resolver {
                datasets: &self.datasets,
                versions: &self.versions,
                access: &self.access,
            }
        }

        fn resolve(
            &self,
            slug: Option<&str>,
            branch: Option<&str>,
            commit: Option<&str>,
        ) -> Result<ResolvedVersion, Detour> {
            let shape = RedirectShape::new("/v2/ds1/").with_query(Some("_from=concepts"));
            self.resolver()
                .resolve(&Requester::anonymous(), slug, branch, commit, &shape)
        }
    }

    fn error_code(result: Result<ResolvedVersion, Detour>) -> &'static str {
        match result {
            Err(Detour::Error(e)) => e.code(),
            other => panic!("expected an error, got {other:?}"),
        }
    }

    fn redirect(result: Result<ResolvedVersion, Detour>) -> String {
        match result {
            Err(Detour::Redirect(location)) => location,
            other => panic!("expected a redirect, got {other:?}"),
        }
    }

    #[test]
    fn test_lookup_errors() {
        let f = Fixture::new();
        assert_eq!(error_code(f.resolve(None, None, None)), "NO_DATASET_GIVEN");
        assert_eq!(error_code(f.resolve(Some(""), None, None)), "NO_DATASET_GIVEN");
        assert_eq!(
            error_code(f.resolve(Some("nope"), None, None)),
            "DATASET_NOT_CONFIGURED"
        );
        assert_eq!(
            error_code(f.resolve(Some("unsynced"), None, None)),
            "DATASET_NOT_FOUND"
        );
        assert_eq!(
            error_code(f.resolve(Some("secret"), Some("master"), Some(MASTER))),
            "DATASET_UNAUTHORIZED"
        );
    }

    #[test]
    fn test_missing_or_unknown_branch_redirects_to_default() {
        let f = Fixture::new();
        assert_eq!(
            redirect(f.resolve(Some("ds1"), None, None)),
            "/v2/ds1/master/abcdef1?_from=concepts"
        );
        assert_eq!(
            redirect(f.resolve(Some("ds1"), Some("feature"), Some(DEV))),
            "/v2/ds1/master/abcdef1?_from=concepts"
        );
    }

    #[test]
    fn test_missing_or_stale_commit_redirects_to_current() {
        let f = Fixture::new();
        assert_eq!(
            redirect(f.resolve(Some("ds1"), Some("dev"), None)),
            "/v2/ds1/dev/0123456?_from=concepts"
        );
        assert_eq!(
            redirect(f.resolve(Some("ds1"), Some("dev"), Some("zzz"))),
            "/v2/ds1/dev/0123456?_from=concepts"
        );
    }

    #[test]
    fn test_full_and_abbreviated_commits_resolve_to_same_version() {
        let f = Fixture::new();
        let full = f.resolve(Some("ds1"), Some("master"), Some(MASTER)).unwrap();
        let short = f
            .resolve(Some("ds1"), Some("master"), Some("abcdef1"))
            .unwrap();
        assert_eq!(full.commit, MASTER);
        assert_eq!(short.commit, MASTER);
        assert_eq!(full.branch, short.branch);
    }

    #[test]
    fn test_redirect_then_follow_terminates() {
        let f = Fixture::new();
        let location = redirect(f.resolve(Some("ds1"), None, None));
        let path = location.split('?').next().unwrap();
        let mut parts = path.trim_start_matches("/v2/ds1/").split('/');
        let branch = parts.next();
        let commit = parts.next();
        assert!(f.resolve(Some("ds1"), branch, commit).is_ok());
    }

    #[test]
    fn test_default_commit_not_resolved() {
        let f = Fixture::new();
        let versions = VersionMap::new();
        versions.publish("ds1", "dev", DEV);
        let resolver = Resolver {
            datasets: &f.datasets,
            versions: &versions,
            access: &f.access,
        };
        let result = resolver.resolve(
            &Requester::anonymous(),
            Some("ds1"),
            None,
            None,
            &RedirectShape::new("/v2/ds1/"),
        );
        assert_eq!(error_code(result), "DEFAULT_COMMIT_NOT_RESOLVED");
    }

    #[test]
    fn test_location_keeps_query_verbatim() {
        let shape = RedirectShape::new("/v2/ds1/")
            .with_suffix("/assets/world.json")
            .with_query(Some("b=2&a=%20x"));
        assert_eq!(
            shape.location("master", MASTER),
            "/v2/ds1/master/abcdef1/assets/world.json?b=2&a=%20x"
        );
        assert_eq!(
            RedirectShape::new("/ds1/").with_query(Some("")).location("dev", DEV),
            "/ds1/dev/0123456"
        );
    }

    #[test]
    fn test_cache_directives() {
        let config = CacheControlConfig::default();
        assert_eq!(
            CacheDirective::NoStore.header_value(&config),
            "no-store, max-age=0"
        );
        assert_eq!(
            CacheDirective::Redirect.header_value(&config),
            "public, s-maxage=300, max-age=300"
        );
        assert_eq!(
            CacheDirective::Immutable.header_value(&config),
            "public, s-maxage=31536000, max-age=14400"
        );
        assert_eq!(
            Outcome::Error(ApiError::NoDatasetGiven).cache(),
            CacheDirective::NoStore
        );
    }

    #[test]
    fn test_render_redirect() {
        let response = Outcome::redirect("/v2/ds1/master/abcdef1".to_string())
            .render(&CacheControlConfig::default(), "");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "/v2/ds1/master/abcdef1");
        assert_eq!(
            response.headers()[CACHE_CONTROL],
            "public, s-maxage=300, max-age=300"
        );
    }
}
