//! Configuration types shared across crates.

use crate::AccessLevel;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:3333").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Resource id of this server in server-scoped ACL rows.
    #[serde(default = "default_server_id")]
    pub server_id: String,
    /// Root directory of dataset working copies (`owner/repo/branch`).
    #[serde(default = "default_datasets_root")]
    pub datasets_root: PathBuf,
    /// Directory for JSON snapshots (control list, ACLs, event ledger).
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    /// Public URL of this server, used in remediation hints.
    #[serde(default)]
    pub public_base_url: Option<String>,
}

fn default_bind() -> String {
    "127.0.0.1:3333".to_string()
}

fn default_server_id() -> String {
    "small-waffle".to_string()
}

fn default_datasets_root() -> PathBuf {
    PathBuf::from("./datasets")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("./backup")
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            server_id: default_server_id(),
            datasets_root: default_datasets_root(),
            backup_dir: default_backup_dir(),
            metrics_enabled: default_metrics_enabled(),
            public_base_url: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server_id.trim().is_empty() {
            return Err("server.server_id cannot be empty".to_string());
        }
        Ok(())
    }
}

/// Where the dataset control list and ACL tables come from.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlConfig {
    /// Supabase PostgREST tables.
    Supabase {
        /// Project URL, e.g. `https://xyz.supabase.co`.
        endpoint: String,
        /// Service role key, sent as `apikey` and bearer token.
        /// WARNING: Prefer WAFFLE_CONTROL__SERVICE_ROLE_KEY over storing in config.
        service_role_key: String,
        #[serde(default = "default_datasets_table")]
        datasets_table: String,
        #[serde(default = "default_acl_table")]
        acl_table: String,
        #[serde(default = "default_permalink_table")]
        permalink_table: String,
    },
    /// Google spreadsheet exported as CSV. Carries no ACL rows.
    Spreadsheet {
        spreadsheet_id: String,
        /// Override of the export URL base (tests, mirrors).
        #[serde(default)]
        export_base: Option<String>,
    },
    /// Serve only what is already in the backup directory.
    #[default]
    File,
}

fn default_datasets_table() -> String {
    "waffle".to_string()
}

fn default_acl_table() -> String {
    "acl".to_string()
}

fn default_permalink_table() -> String {
    "permalinks".to_string()
}

impl ControlConfig {
    /// Validate control source configuration.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ControlConfig::Supabase {
                endpoint,
                service_role_key,
                ..
            } => {
                if endpoint.is_empty() {
                    return Err("control.endpoint is required for supabase".to_string());
                }
                if service_role_key.is_empty() {
                    return Err("control.service_role_key is required for supabase".to_string());
                }
                Ok(())
            }
            ControlConfig::Spreadsheet { spreadsheet_id, .. } if spreadsheet_id.is_empty() => {
                Err("control.spreadsheet_id is required for spreadsheet".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Request authentication configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret verifying `Authorization: Bearer` user tokens.
    /// Without it every request is anonymous.
    #[serde(default)]
    pub jwt_secret: Option<String>,
    /// Server-scope level granted to every request, including anonymous ones.
    #[serde(default = "default_anonymous_server_level")]
    pub anonymous_server_level: Option<AccessLevel>,
}

fn default_anonymous_server_level() -> Option<AccessLevel> {
    Some(AccessLevel::Reader)
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            anonymous_server_level: default_anonymous_server_level(),
        }
    }
}

/// GitHub access used for commit lookups and clones.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GithubConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Base URL that `owner/repo.git` is appended to when cloning.
    #[serde(default = "default_clone_base")]
    pub clone_base: String,
    /// Static token. Takes precedence over App credentials.
    #[serde(default)]
    pub token: Option<String>,
    /// GitHub App id.
    #[serde(default)]
    pub app_id: Option<String>,
    /// PEM file with the App's RSA private key.
    #[serde(default)]
    pub app_private_key_path: Option<PathBuf>,
    /// Installation used for datasets without a fetcher identity.
    #[serde(default)]
    pub default_installation_id: Option<String>,
    #[serde(default = "default_commit_lookup_timeout_secs")]
    pub commit_lookup_timeout_secs: u64,
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_clone_base() -> String {
    "https://github.com".to_string()
}

fn default_commit_lookup_timeout_secs() -> u64 {
    10
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            clone_base: default_clone_base(),
            token: None,
            app_id: None,
            app_private_key_path: None,
            default_installation_id: None,
            commit_lookup_timeout_secs: default_commit_lookup_timeout_secs(),
        }
    }
}

impl GithubConfig {
    pub fn commit_lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.commit_lookup_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        match (self.app_id.as_ref(), self.app_private_key_path.as_ref()) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => {
                return Err(
                    "github config requires both app_id and app_private_key_path when either is set"
                        .to_string(),
                );
            }
        }
        if self.commit_lookup_timeout_secs == 0 {
            return Err("github.commit_lookup_timeout_secs cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Sync orchestrator and git worker configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Interval between job status polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Overall bound on waiting for one git job.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// Attempts per git job before it is marked as failed.
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    /// Retry delay is `backoff_base_ms * tries^2`.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// File whose presence marks a branch directory as cloned.
    #[serde(default = "default_marker_file")]
    pub marker_file: String,
    /// Periodic full sync. Disabled when unset.
    #[serde(default)]
    pub auto_sync_interval_secs: Option<u64>,
    /// Run a full sync right after startup.
    #[serde(default)]
    pub sync_on_startup: bool,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_poll_timeout_secs() -> u64 {
    600 // 10 minutes
}

fn default_max_tries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_marker_file() -> String {
    "datapackage.json".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_secs: default_poll_timeout_secs(),
            max_tries: default_max_tries(),
            backoff_base_ms: default_backoff_base_ms(),
            marker_file: default_marker_file(),
            auto_sync_interval_secs: None,
            sync_on_startup: false,
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn auto_sync_interval(&self) -> Option<Duration> {
        self.auto_sync_interval_secs.map(Duration::from_secs)
    }

    /// Validate sync configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_ms == 0 {
            return Err("sync.poll_interval_ms cannot be 0".to_string());
        }
        if self.max_tries == 0 {
            return Err("sync.max_tries must be at least 1".to_string());
        }
        if self.auto_sync_interval_secs == Some(0) {
            // tokio::time::interval panics on a zero period
            return Err("sync.auto_sync_interval_secs cannot be 0".to_string());
        }
        if self.marker_file.is_empty() || self.marker_file.contains('/') {
            return Err(format!(
                "sync.marker_file must be a plain file name, got {:?}",
                self.marker_file
            ));
        }
        Ok(())
    }
}

/// Event ledger persistence configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Hourly, daily, weekly and monthly snapshots.
    #[serde(default = "default_true")]
    pub backup_schedule_enabled: bool,
    /// Load the `hourly` snapshot at startup.
    #[serde(default = "default_true")]
    pub restore_on_startup: bool,
}

fn default_true() -> bool {
    true
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            backup_schedule_enabled: true,
            restore_on_startup: true,
        }
    }
}

/// Cache-Control lifetimes per outcome kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheControlConfig {
    #[serde(default = "default_redirect_max_age_secs")]
    pub redirect_max_age_secs: u64,
    #[serde(default = "default_success_s_maxage_secs")]
    pub success_s_maxage_secs: u64,
    #[serde(default = "default_success_max_age_secs")]
    pub success_max_age_secs: u64,
}

fn default_redirect_max_age_secs() -> u64 {
    300 // 5 minutes
}

fn default_success_s_maxage_secs() -> u64 {
    31_536_000 // 1 year
}

fn default_success_max_age_secs() -> u64 {
    14_400 // 4 hours
}

impl Default for CacheControlConfig {
    fn default() -> Self {
        Self {
            redirect_max_age_secs: default_redirect_max_age_secs(),
            success_s_maxage_secs: default_success_s_maxage_secs(),
            success_max_age_secs: default_success_max_age_secs(),
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub cache_control: CacheControlConfig,
}

impl AppConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        self.control.validate()?;
        self.github.validate()?;
        self.sync.validate()?;
        Ok(())
    }

    /// Create a test configuration rooted at `root`.
    ///
    /// **For testing only.** File control source, no scheduled jobs,
    /// fast polling and no retry backoff.
    pub fn for_testing(root: &std::path::Path) -> Self {
        Self {
            server: ServerConfig {
                datasets_root: root.join("datasets"),
                backup_dir: root.join("backup"),
                ..ServerConfig::default()
            },
            control: ControlConfig::File,
            auth: AuthConfig {
                jwt_secret: Some("test-jwt-secret".to_string()),
                ..AuthConfig::default()
            },
            github: GithubConfig::default(),
            sync: SyncConfig {
                poll_interval_ms: 10,
                poll_timeout_secs: 10,
                backoff_base_ms: 0,
                ..SyncConfig::default()
            },
            events: EventsConfig {
                backup_schedule_enabled: false,
                restore_on_startup: false,
            },
            cache_control: CacheControlConfig::default(),
        }
    }
}
