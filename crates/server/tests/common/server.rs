//! Server test utilities.

use super::fakes::{FakeGit, FakeRemote};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;
use waffle_core::config::AppConfig;
use waffle_core::{AccessControlRow, AccessLevel, DatasetControlList, DatasetEntry};
use waffle_registry::StaticSource;
use waffle_server::auth::{UserClaims, hash_token};
use waffle_server::bootstrap::initialize;
use waffle_server::reader::DatapackageFactory;
use waffle_server::sync::{SyncAuthority, SyncScope};
use waffle_server::{AppState, Collaborators, create_router};

/// Remote tip of `ds1/master`.
pub const MASTER: &str = "abcdef1234567890abcdef1234567890abcdef12";
/// Remote tip of `ds1/dev`.
pub const DEV: &str = "0123456789abcdef0123456789abcdef01234567";
/// Remote tip of `ds2/master`.
pub const DS2_MASTER: &str = "fedcba9876543210fedcba9876543210fedcba98";

/// Share token granting read access to `ds2`.
#[allow(dead_code)]
pub const DS2_SHARE_TOKEN: &str = "share-ds2";

/// A test server wrapper with fake collaborators.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub source: Arc<StaticSource>,
    pub remote: Arc<FakeRemote>,
    pub git: Arc<FakeGit>,
    _temp_dir: TempDir,
}

/// `ds1` (public, master and dev) and `ds2` (private, master).
pub fn datasets() -> DatasetControlList {
    DatasetControlList::new(vec![
        DatasetEntry {
            slug: "ds1".to_string(),
            repo_id: "acme/ds1".to_string(),
            branches: vec!["master".to_string(), "dev".to_string()],
            default_branch: Some("master".to_string()),
            is_private: false,
            fetcher_identity: None,
        },
        DatasetEntry {
            slug: "ds2".to_string(),
            repo_id: "acme/ds2".to_string(),
            branches: vec!["master".to_string()],
            default_branch: None,
            is_private: true,
            fetcher_identity: None,
        },
    ])
}

fn user_acl() -> Vec<AccessControlRow> {
    vec![
        AccessControlRow::server("owner-1", "small-waffle", AccessLevel::Owner),
        AccessControlRow::dataset("editor-1", "ds1", AccessLevel::Editor),
        AccessControlRow::dataset("reader-2", "ds2", AccessLevel::Reader),
    ]
}

fn permalink_acl() -> Vec<AccessControlRow> {
    vec![AccessControlRow::dataset(
        &hash_token(DS2_SHARE_TOKEN),
        "ds2",
        AccessLevel::Reader,
    )]
}

#[allow(dead_code)]
impl TestServer {
    /// Create an initialized server; nothing is synced yet.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let mut config = AppConfig::for_testing(temp_dir.path());
        modifier(&mut config);

        let source = Arc::new(StaticSource::new(datasets(), user_acl(), permalink_acl()));
        let remote = Arc::new(FakeRemote::new());
        remote.set("ds1", "master", MASTER);
        remote.set("ds1", "dev", DEV);
        remote.set("ds2", "master", DS2_MASTER);
        let git = Arc::new(FakeGit::new(remote.clone()));

        let collaborators = Collaborators {
            source: Some(Box::new(source.clone())),
            commits: remote.clone(),
            git: git.clone(),
            readers: Arc::new(DatapackageFactory),
        };
        let state = AppState::new(config, collaborators);
        initialize(&state).await.expect("Failed to initialize state");
        let router = create_router(state.clone());

        Self {
            router,
            state,
            source,
            remote,
            git,
            _temp_dir: temp_dir,
        }
    }

    /// Create a server with every listed branch synced.
    pub async fn synced() -> Self {
        let server = Self::new().await;
        server.sync_and_wait().await;
        server
    }

    /// Run a system sync of everything and wait for it to finish.
    pub async fn sync_and_wait(&self) {
        self.state
            .sync
            .sync_if_not_already_syncing(SyncScope::All, SyncAuthority::System);
        self.wait_idle().await;
    }

    /// Wait until no sync is running.
    pub async fn wait_idle(&self) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.state.sync.status().ongoing {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Sync did not finish in time");
    }

    /// Send a GET request with optional extra headers.
    pub async fn get(&self, uri: &str, headers: &[(&str, &str)]) -> Response {
        let mut builder = Request::builder().method("GET").uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(Body::empty()).unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// GET `uri` as an anonymous client and decode the JSON body.
    pub async fn get_json(&self, uri: &str) -> (StatusCode, Value) {
        let response = self.get(uri, &[]).await;
        let status = response.status();
        (status, body_json(response).await)
    }

    /// GET `uri` with a bearer token for `user` and decode the JSON body.
    pub async fn get_json_as(&self, uri: &str, user: &str) -> (StatusCode, Value) {
        let auth = format!("Bearer {}", user_token(user));
        let response = self.get(uri, &[("Authorization", auth.as_str())]).await;
        let status = response.status();
        (status, body_json(response).await)
    }
}

/// Decode a response body as JSON, `Null` if empty or not JSON.
pub async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    }
}

/// HS256 user token for `sub`, valid for an hour.
pub fn user_token(sub: &str) -> String {
    let exp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 3600;
    let claims = UserClaims {
        sub: sub.to_string(),
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"test-jwt-secret"),
    )
    .unwrap()
}
