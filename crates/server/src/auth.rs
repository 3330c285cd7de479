//! Authentication middleware.
//!
//! Establishes who is asking. Authorization happens later, per operation,
//! through [`crate::access::AccessResolver`].

use crate::access::Requester;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::Instrument;
use uuid::Uuid;

/// Maximum length for trace IDs.
/// Longer trace IDs are truncated to prevent log bloat and potential log injection.
const MAX_TRACE_ID_LEN: usize = 128;

/// Header carrying a permalink share token.
pub const SHARE_TOKEN_HEADER: &str = "x-share-token";

/// Trace ID for request correlation.
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

impl TraceId {
    /// Generate a new random trace ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a trace ID from a client-provided value.
    /// Truncated to MAX_TRACE_ID_LEN characters, non-printable characters removed.
    pub fn from_client(value: &str) -> Self {
        let sanitized: String = value
            .chars()
            .take(MAX_TRACE_ID_LEN)
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect();

        if sanitized.is_empty() {
            Self::new()
        } else {
            Self(sanitized)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Claims of a user token issued by the identity provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserClaims {
    /// User id, the principal of user ACL rows.
    pub sub: String,
    pub exp: u64,
}

/// Extract bearer token from Authorization header.
/// Per RFC 6750, the "Bearer" scheme is case-insensitive.
fn extract_bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(&v[7..])
            } else {
                None
            }
        })
}

fn extract_share_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(SHARE_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Extract trace ID from X-Trace-Id header or generate a new one.
fn extract_or_generate_trace_id(req: &Request) -> TraceId {
    req.headers()
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(TraceId::from_client)
        .unwrap_or_else(TraceId::new)
}

/// Hash a share token for permalink ACL lookup.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify an HS256 user token and return its subject.
pub fn verify_user_token(token: &str, secret: Option<&str>) -> ApiResult<String> {
    let secret = secret.ok_or_else(|| {
        ApiError::InvalidCredentials("user tokens are not accepted by this server".to_string())
    })?;
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_aud = false;
    let data = decode::<UserClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| ApiError::InvalidCredentials(e.to_string()))?;
    if data.claims.sub.is_empty() {
        return Err(ApiError::InvalidCredentials("token has no subject".to_string()));
    }
    Ok(data.claims.sub)
}

/// Authentication middleware: sets up trace context and the [`Requester`].
///
/// Requests without credentials continue as anonymous. A bearer token that
/// fails verification is rejected outright.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let trace_id = extract_or_generate_trace_id(&req);
    let trace_id_str = trace_id.0.clone();
    req.extensions_mut().insert(trace_id);

    let user = match extract_bearer_token(&req) {
        Some(token) => {
            let user = verify_user_token(token, state.config.auth.jwt_secret.as_deref())
                .inspect_err(|e| tracing::debug!(error = %e, "Rejected bearer token"))?;
            Some(user)
        }
        None => None,
    };
    let requester = Requester {
        user,
        permalink_hash: extract_share_token(&req).map(hash_token),
    };
    req.extensions_mut().insert(requester);

    let response = next
        .run(req)
        .instrument(tracing::info_span!("request", trace_id = %trace_id_str))
        .await;

    Ok(response)
}

/// Requester set by the middleware, anonymous if absent.
pub fn get_requester(req: &Request) -> Requester {
    req.extensions().get::<Requester>().cloned().unwrap_or_default()
}
