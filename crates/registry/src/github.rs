//! GitHub credentials: a static token or GitHub App installation tokens.

use crate::error::{RegistryError, RegistryResult};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use waffle_core::config::GithubConfig;

/// Installation tokens are refreshed this long before they expire.
const REFRESH_MARGIN: time::Duration = time::Duration::minutes(5);
/// Lifetime of the App JWT used to request installation tokens.
const APP_JWT_LIFETIME_SECS: i64 = 600;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Deserialize)]
struct InstallationTokenResponse {
    token: String,
    #[serde(with = "time::serde::rfc3339")]
    expires_at: OffsetDateTime,
}

struct AppCredentials {
    app_id: String,
    key: EncodingKey,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: OffsetDateTime,
}

/// Hands out tokens for the GitHub API and for git over HTTPS.
pub struct GithubAuth {
    http: reqwest::Client,
    api_base: String,
    static_token: Option<String>,
    app: Option<AppCredentials>,
    default_installation: Option<String>,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl GithubAuth {
    /// Build from configuration, reading the App private key if configured.
    pub fn from_config(config: &GithubConfig) -> RegistryResult<Self> {
        config.validate().map_err(RegistryError::Config)?;
        let app = match (&config.app_id, &config.app_private_key_path) {
            (Some(app_id), Some(path)) => {
                let pem = std::fs::read(path).map_err(|e| {
                    RegistryError::Config(format!(
                        "failed to read GitHub App key {}: {e}",
                        path.display()
                    ))
                })?;
                Some(AppCredentials {
                    app_id: app_id.clone(),
                    key: EncodingKey::from_rsa_pem(&pem)?,
                })
            }
            _ => None,
        };
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .user_agent(concat!("waffle/", env!("CARGO_PKG_VERSION")))
                .build()?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            static_token: config.token.clone().filter(|t| !t.is_empty()),
            app,
            default_installation: config.default_installation_id.clone(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// No credentials: public repositories only.
    pub fn anonymous() -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: String::new(),
            static_token: None,
            app: None,
            default_installation: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Token for a dataset fetched under `installation`, or `None` when no
    /// credentials apply (public access).
    pub async fn token_for(&self, installation: Option<&str>) -> RegistryResult<Option<String>> {
        if let Some(token) = &self.static_token {
            return Ok(Some(token.clone()));
        }
        let Some(app) = &self.app else {
            return Ok(None);
        };
        let Some(installation) = installation.or(self.default_installation.as_deref()) else {
            return Ok(None);
        };

        let mut cache = self.cache.lock().await;
        let now = OffsetDateTime::now_utc();
        if let Some(cached) = cache.get(installation)
            && now < cached.expires_at - REFRESH_MARGIN
        {
            return Ok(Some(cached.token.clone()));
        }

        tracing::info!(installation, "Requesting GitHub App installation token");
        let fresh = self.request_installation_token(app, installation, now).await?;
        let token = fresh.token.clone();
        cache.insert(installation.to_string(), fresh);
        Ok(Some(token))
    }

    async fn request_installation_token(
        &self,
        app: &AppCredentials,
        installation: &str,
        now: OffsetDateTime,
    ) -> RegistryResult<CachedToken> {
        let iat = now.unix_timestamp() - 60; // tolerate clock drift
        let claims = AppClaims {
            iat,
            exp: iat + APP_JWT_LIFETIME_SECS,
            iss: app.app_id.clone(),
        };
        let jwt = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &app.key)?;

        let url = format!(
            "{}/app/installations/{installation}/access_tokens",
            self.api_base
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(jwt)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Upstream {
                url,
                status: status.as_u16(),
                body,
            });
        }
        let body: InstallationTokenResponse = response.json().await?;
        Ok(CachedToken {
            token: body.token,
            expires_at: body.expires_at,
        })
    }
}
