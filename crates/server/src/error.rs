//! API error types.
//!
//! Every failure that reaches a client is one [`ApiError`] variant. Each
//! variant has a stable code, a single HTTP status and a remediation hint;
//! the JSON body is `{status, error}` and is never cached.

use crate::reader::ReaderError;
use axum::Json;
use axum::http::header::CACHE_CONTROL;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Cache-Control of every error response.
pub const NO_STORE: &str = "no-store, max-age=0";

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// HTTP status, repeated in the body.
    pub status: u16,
    /// Short message followed by the remediation hint.
    pub error: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Received a request with no dataset provided")]
    NoDatasetGiven,

    #[error("Dataset not configured: {slug}")]
    DatasetNotConfigured { slug: String },

    #[error("Branch not configured: {slug}/{branch}")]
    BranchNotConfigured { slug: String, branch: String },

    #[error("Dataset present in config but not correctly synced: {slug}")]
    DatasetNotFound { slug: String },

    #[error("User doesn't have access to the dataset or needs to login: {slug}")]
    DatasetUnauthorized { slug: String },

    #[error("User doesn't have the rights to sync {target}")]
    SyncUnauthorized { target: String },

    #[error("User doesn't have the rights to {action}")]
    OperatorUnauthorized { action: &'static str },

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Server failed to resolve the default commit for dataset {slug}")]
    DefaultCommitNotResolved { slug: String },

    #[error("No reader instance found for {slug}/{branch}/{commit}")]
    NoReaderInstance {
        slug: String,
        branch: String,
        commit: String,
    },

    #[error("No query provided for {slug}")]
    NoQueryProvided { slug: String },

    #[error("Query failed to parse for {slug}")]
    QueryParsingError { slug: String },

    #[error("No asset provided in the route")]
    AssetNotProvided,

    /// Rejected by the query engine; its message is passed through as is.
    #[error("{0}")]
    QueryValidation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoDatasetGiven => "NO_DATASET_GIVEN",
            Self::DatasetNotConfigured { .. } => "DATASET_NOT_CONFIGURED",
            Self::BranchNotConfigured { .. } => "BRANCH_NOT_CONFIGURED",
            Self::DatasetNotFound { .. } => "DATASET_NOT_FOUND",
            Self::DatasetUnauthorized { .. } => "DATASET_UNAUTHORIZED",
            Self::SyncUnauthorized { .. } => "SYNC_UNAUTHORIZED",
            Self::OperatorUnauthorized { .. } => "OPERATOR_UNAUTHORIZED",
            Self::InvalidCredentials(_) => "INVALID_CREDENTIALS",
            Self::DefaultCommitNotResolved { .. } => "DEFAULT_COMMIT_NOT_RESOLVED",
            Self::NoReaderInstance { .. } => "NO_READER_INSTANCE",
            Self::NoQueryProvided { .. } => "NO_QUERY_PROVIDED",
            Self::QueryParsingError { .. } => "QUERY_PARSING_ERROR",
            Self::AssetNotProvided => "ASSET_NOT_PROVIDED",
            Self::QueryValidation(_) => "QUERY_VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoDatasetGiven => StatusCode::BAD_REQUEST,
            Self::DatasetNotConfigured { .. } => StatusCode::FORBIDDEN,
            Self::BranchNotConfigured { .. } => StatusCode::FORBIDDEN,
            Self::DatasetNotFound { .. } => StatusCode::NOT_FOUND,
            Self::DatasetUnauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::SyncUnauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::OperatorUnauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::InvalidCredentials(_) => StatusCode::UNAUTHORIZED,
            Self::DefaultCommitNotResolved { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NoReaderInstance { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NoQueryProvided { .. } => StatusCode::BAD_REQUEST,
            Self::QueryParsingError { .. } => StatusCode::BAD_REQUEST,
            Self::AssetNotProvided => StatusCode::BAD_REQUEST,
            Self::QueryValidation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// What the client can do about it. `base_url` prefixes suggested links.
    pub fn hint(&self, base_url: &str) -> Option<String> {
        let sync = |slug: &str| format!("Try to sync this dataset {base_url}/sync/{slug}");
        match self {
            Self::NoDatasetGiven => Some(format!(
                "Please specify a dataset like {base_url}/v2/fasttrack"
            )),
            Self::DatasetNotConfigured { .. } | Self::BranchNotConfigured { .. } => Some(
                "Check if the dataset is correctly added into the control list on google spreadsheet or supabase"
                    .to_string(),
            ),
            Self::DatasetNotFound { slug }
            | Self::DefaultCommitNotResolved { slug }
            | Self::NoReaderInstance { slug, .. } => Some(sync(slug)),
            Self::DatasetUnauthorized { slug } => Some(format!(
                "Log in, make sure you have permission rights, then sync the dataset {base_url}/sync/{slug}"
            )),
            Self::SyncUnauthorized { .. } => {
                Some("Log in with an account that has editor rights".to_string())
            }
            Self::NoQueryProvided { .. } => {
                Some("The URL must have a DDFQL query part after ?".to_string())
            }
            Self::QueryParsingError { .. } => Some(
                "The URL query must be a valid URLON v2.1.0 string. note! this is the old URLON version"
                    .to_string(),
            ),
            Self::AssetNotProvided => Some(format!(
                "Please specify an asset like {base_url}/v2/sg-master/assets/world-50m.json"
            )),
            Self::OperatorUnauthorized { .. }
            | Self::InvalidCredentials(_)
            | Self::QueryValidation(_)
            | Self::NotFound(_)
            | Self::Internal(_) => None,
        }
    }

    /// Render with hints pointing at `base_url`.
    pub fn into_response_with_base(self, base_url: &str) -> Response {
        let status = self.status_code();
        let error = match self.hint(base_url) {
            Some(hint) => format!("{self} {hint}"),
            None => self.to_string(),
        };
        let body = ErrorResponse {
            status: status.as_u16(),
            error,
        };
        let mut response = (status, Json(body)).into_response();
        response
            .headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static(NO_STORE));
        response
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.into_response_with_base("")
    }
}

impl From<ReaderError> for ApiError {
    fn from(e: ReaderError) -> Self {
        match e {
            ReaderError::Validation(message) => Self::QueryValidation(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<waffle_git::GitError> for ApiError {
    fn from(e: waffle_git::GitError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<waffle_registry::RegistryError> for ApiError {
    fn from(e: waffle_registry::RegistryError) -> Self {
        match e {
            waffle_registry::RegistryError::NotFound(what) => Self::NotFound(what),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<crate::ledger::LedgerError> for ApiError {
    fn from(e: crate::ledger::LedgerError) -> Self {
        use crate::ledger::LedgerError;
        match e {
            LedgerError::InvalidName(_) => Self::QueryValidation(e.to_string()),
            LedgerError::NotFound(name) => Self::NotFound(format!("event backup {name}")),
            LedgerError::Busy | LedgerError::Snapshot(_) => Self::Internal(e.to_string()),
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
