//! Sources of the dataset control list and ACL tables.

use crate::error::{RegistryError, RegistryResult};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::RwLock;
use std::time::Duration;
use waffle_core::config::ControlConfig;
use waffle_core::{AccessControlRow, DatasetControlList, DatasetEntry};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const SPREADSHEET_EXPORT_BASE: &str = "https://docs.google.com/spreadsheets/d";

/// Provider of the dataset control list and the two ACL tables.
#[async_trait]
pub trait ControlSource: Send + Sync {
    /// Fetch the dataset control list.
    async fn fetch_datasets(&self) -> RegistryResult<DatasetControlList>;

    /// Fetch grants keyed by authenticated user id.
    async fn fetch_user_acl(&self) -> RegistryResult<Vec<AccessControlRow>>;

    /// Fetch grants keyed by permalink token hash.
    async fn fetch_permalink_acl(&self) -> RegistryResult<Vec<AccessControlRow>>;

    /// Source name for logs.
    fn name(&self) -> &'static str;
}

#[async_trait]
impl<T: ControlSource + ?Sized> ControlSource for std::sync::Arc<T> {
    async fn fetch_datasets(&self) -> RegistryResult<DatasetControlList> {
        (**self).fetch_datasets().await
    }

    async fn fetch_user_acl(&self) -> RegistryResult<Vec<AccessControlRow>> {
        (**self).fetch_user_acl().await
    }

    async fn fetch_permalink_acl(&self) -> RegistryResult<Vec<AccessControlRow>> {
        (**self).fetch_permalink_acl().await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Build the configured control source. `None` means snapshots only.
pub fn from_config(config: &ControlConfig) -> RegistryResult<Option<Box<dyn ControlSource>>> {
    config.validate().map_err(RegistryError::Config)?;
    match config {
        ControlConfig::Supabase {
            endpoint,
            service_role_key,
            datasets_table,
            acl_table,
            permalink_table,
        } => Ok(Some(Box::new(SupabaseSource::new(
            endpoint,
            service_role_key,
            datasets_table,
            acl_table,
            permalink_table,
        )?))),
        ControlConfig::Spreadsheet {
            spreadsheet_id,
            export_base,
        } => Ok(Some(Box::new(SpreadsheetSource::new(
            spreadsheet_id,
            export_base.as_deref(),
        )?))),
        ControlConfig::File => Ok(None),
    }
}

fn http_client() -> RegistryResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .user_agent(concat!("waffle/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(RegistryError::Http)
}

async fn check_status(url: &str, response: reqwest::Response) -> RegistryResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RegistryError::Upstream {
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

/// Dataset row as stored in both the Supabase table and the spreadsheet.
#[derive(Debug, Deserialize)]
struct ControlRow {
    id: String,
    github_repo_id: String,
    #[serde(default)]
    branches: String,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    is_private: Option<serde_json::Value>,
    #[serde(default)]
    waffle_fetcher_app_installation_id: Option<serde_json::Value>,
}

impl ControlRow {
    fn into_entry(self) -> RegistryResult<DatasetEntry> {
        let entry = DatasetEntry {
            slug: self.id.trim().to_string(),
            repo_id: self.github_repo_id.trim().to_string(),
            branches: split_branches(&self.branches),
            default_branch: self
                .default_branch
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty()),
            is_private: parse_flag(self.is_private.as_ref()),
            fetcher_identity: self
                .waffle_fetcher_app_installation_id
                .as_ref()
                .and_then(value_to_string),
        };
        entry.validate()?;
        Ok(entry)
    }
}

fn split_branches(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(str::to_string)
        .collect()
}

/// Booleans arrive as JSON booleans from Supabase and as `TRUE`/`FALSE` from spreadsheets.
fn parse_flag(value: Option<&serde_json::Value>) -> bool {
    match value {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn value_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Convert rows, dropping the ones that fail validation.
fn collect_entries(source: &str, rows: Vec<ControlRow>) -> DatasetControlList {
    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let id = row.id.clone();
        match row.into_entry() {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::warn!(source, id = %id, error = %e, "Skipping invalid dataset row"),
        }
    }
    DatasetControlList::new(entries)
}

/// Supabase PostgREST tables.
pub struct SupabaseSource {
    http: reqwest::Client,
    endpoint: String,
    key: String,
    datasets_table: String,
    acl_table: String,
    permalink_table: String,
}

impl SupabaseSource {
    pub fn new(
        endpoint: &str,
        key: &str,
        datasets_table: &str,
        acl_table: &str,
        permalink_table: &str,
    ) -> RegistryResult<Self> {
        Ok(Self {
            http: http_client()?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            key: key.to_string(),
            datasets_table: datasets_table.to_string(),
            acl_table: acl_table.to_string(),
            permalink_table: permalink_table.to_string(),
        })
    }

    async fn fetch_table<T: DeserializeOwned>(&self, table: &str) -> RegistryResult<Vec<T>> {
        let url = format!("{}/rest/v1/{table}", self.endpoint);
        tracing::info!(table, endpoint = %self.endpoint, "Fetching Supabase table");
        let response = self
            .http
            .get(&url)
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        let response = check_status(&url, response).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ControlSource for SupabaseSource {
    async fn fetch_datasets(&self) -> RegistryResult<DatasetControlList> {
        let rows: Vec<ControlRow> = self.fetch_table(&self.datasets_table).await?;
        Ok(collect_entries(self.name(), rows))
    }

    async fn fetch_user_acl(&self) -> RegistryResult<Vec<AccessControlRow>> {
        self.fetch_table(&self.acl_table).await
    }

    async fn fetch_permalink_acl(&self) -> RegistryResult<Vec<AccessControlRow>> {
        self.fetch_table(&self.permalink_table).await
    }

    fn name(&self) -> &'static str {
        "supabase"
    }
}

/// Google spreadsheet exported as CSV.
pub struct SpreadsheetSource {
    http: reqwest::Client,
    url: String,
}

impl SpreadsheetSource {
    pub fn new(spreadsheet_id: &str, export_base: Option<&str>) -> RegistryResult<Self> {
        let base = export_base
            .unwrap_or(SPREADSHEET_EXPORT_BASE)
            .trim_end_matches('/');
        Ok(Self {
            http: http_client()?,
            url: format!("{base}/{spreadsheet_id}/export?format=csv"),
        })
    }
}

/// Parse the spreadsheet export. Extra columns are ignored.
fn parse_spreadsheet_csv(body: &[u8]) -> RegistryResult<Vec<ControlRow>> {
    #[derive(Deserialize)]
    struct CsvRow {
        id: String,
        github_repo_id: String,
        #[serde(default)]
        branches: String,
        #[serde(default)]
        default_branch: String,
        #[serde(default)]
        is_private: String,
        #[serde(default)]
        waffle_fetcher_app_installation_id: String,
    }

    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(body);
    let mut rows = Vec::new();
    for record in reader.deserialize::<CsvRow>() {
        let row = record?;
        rows.push(ControlRow {
            id: row.id,
            github_repo_id: row.github_repo_id,
            branches: row.branches,
            default_branch: Some(row.default_branch),
            is_private: Some(serde_json::Value::String(row.is_private)),
            waffle_fetcher_app_installation_id: Some(serde_json::Value::String(
                row.waffle_fetcher_app_installation_id,
            )),
        });
    }
    Ok(rows)
}

#[async_trait]
impl ControlSource for SpreadsheetSource {
    async fn fetch_datasets(&self) -> RegistryResult<DatasetControlList> {
        tracing::info!(url = %self.url, "Fetching dataset control list from spreadsheet");
        let response = self.http.get(&self.url).send().await?;
        let response = check_status(&self.url, response).await?;
        let body = response.bytes().await?;
        let rows = parse_spreadsheet_csv(&body)?;
        Ok(collect_entries(self.name(), rows))
    }

    async fn fetch_user_acl(&self) -> RegistryResult<Vec<AccessControlRow>> {
        Ok(Vec::new())
    }

    async fn fetch_permalink_acl(&self) -> RegistryResult<Vec<AccessControlRow>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "spreadsheet"
    }
}

/// In-memory source whose contents can be swapped at runtime.
///
/// Used by embedders and tests that manage the control list themselves.
#[derive(Default)]
pub struct StaticSource {
    inner: RwLock<StaticContents>,
}

#[derive(Clone, Default)]
struct StaticContents {
    datasets: DatasetControlList,
    users: Vec<AccessControlRow>,
    permalinks: Vec<AccessControlRow>,
    unavailable: bool,
}

impl StaticSource {
    pub fn new(
        datasets: DatasetControlList,
        users: Vec<AccessControlRow>,
        permalinks: Vec<AccessControlRow>,
    ) -> Self {
        Self {
            inner: RwLock::new(StaticContents {
                datasets,
                users,
                permalinks,
                unavailable: false,
            }),
        }
    }

    pub fn set_datasets(&self, datasets: DatasetControlList) {
        if let Ok(mut inner) = self.inner.write() {
            inner.datasets = datasets;
        }
    }

    pub fn set_user_acl(&self, rows: Vec<AccessControlRow>) {
        if let Ok(mut inner) = self.inner.write() {
            inner.users = rows;
        }
    }

    pub fn set_permalink_acl(&self, rows: Vec<AccessControlRow>) {
        if let Ok(mut inner) = self.inner.write() {
            inner.permalinks = rows;
        }
    }

    /// Make every fetch fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut inner) = self.inner.write() {
            inner.unavailable = unavailable;
        }
    }

    fn contents(&self) -> RegistryResult<StaticContents> {
        let inner = self
            .inner
            .read()
            .map_err(|_| RegistryError::Config("static source lock poisoned".to_string()))?;
        if inner.unavailable {
            return Err(RegistryError::NotFound("static source unavailable".to_string()));
        }
        Ok(inner.clone())
    }
}

#[async_trait]
impl ControlSource for StaticSource {
    async fn fetch_datasets(&self) -> RegistryResult<DatasetControlList> {
        Ok(self.contents()?.datasets)
    }

    async fn fetch_user_acl(&self) -> RegistryResult<Vec<AccessControlRow>> {
        Ok(self.contents()?.users)
    }

    async fn fetch_permalink_acl(&self) -> RegistryResult<Vec<AccessControlRow>> {
        Ok(self.contents()?.permalinks)
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spreadsheet_csv() {
        let body = b"id,github_repo_id,branches,default_branch,is_private,waffle_fetcher_app_installation_id,notes\n\
fasttrack,open-numbers/ddf--gapminder--fasttrack,\"master, dev\",master,FALSE,,x\n\
secret,acme/ddf--secret,main,,TRUE,4242,\n";
        let rows = parse_spreadsheet_csv(body).unwrap();
        let list = collect_entries("test", rows);
        assert_eq!(list.len(), 2);

        let fasttrack = list.get("fasttrack").unwrap();
        assert_eq!(fasttrack.branches, vec!["master", "dev"]);
        assert_eq!(fasttrack.default_branch.as_deref(), Some("master"));
        assert!(!fasttrack.is_private);
        assert_eq!(fasttrack.fetcher_identity, None);

        let secret = list.get("secret").unwrap();
        assert!(secret.is_private);
        assert_eq!(secret.default_branch, None);
        assert_eq!(secret.default_branch(), Some("main"));
        assert_eq!(secret.fetcher_identity.as_deref(), Some("4242"));
    }

    #[test]
    fn test_invalid_rows_are_skipped() {
        let body = b"id,github_repo_id,branches,default_branch,is_private,waffle_fetcher_app_installation_id\n\
ok,acme/ok,main,main,FALSE,\n\
bad,../etc,main,main,FALSE,\n";
        let list = collect_entries("test", parse_spreadsheet_csv(body).unwrap());
        assert_eq!(list.len(), 1);
        assert!(list.contains("ok"));
    }

    #[test]
    fn test_supabase_row_with_numeric_installation() {
        let json = r#"[{"id":"ds1","github_repo_id":"acme/ds1","branches":"master,dev","default_branch":"master","is_private":true,"waffle_fetcher_app_installation_id":123}]"#;
        let rows: Vec<ControlRow> = serde_json::from_str(json).unwrap();
        let list = collect_entries("test", rows);
        let e = list.get("ds1").unwrap();
        assert!(e.is_private);
        assert_eq!(e.fetcher_identity.as_deref(), Some("123"));
        assert_eq!(e.branches, vec!["master", "dev"]);
    }

    #[tokio::test]
    async fn test_static_source_unavailable() {
        let source = StaticSource::default();
        assert!(source.fetch_datasets().await.unwrap().is_empty());
        source.set_unavailable(true);
        assert!(source.fetch_datasets().await.is_err());
        assert!(source.fetch_user_acl().await.is_err());
    }
}
