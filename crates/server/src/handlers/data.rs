//! Dataset routes: queries, metadata and assets.
//!
//! Every request walks the resolver, is answered with one [`Outcome`] and is
//! recorded in the event ledger whatever that outcome is.

use crate::access::Requester;
use crate::auth::get_requester;
use crate::error::ApiError;
use crate::metrics;
use crate::query::{self, QueryError};
use crate::resolver::{CacheDirective, Outcome, RedirectShape, Resolver};
use crate::state::AppState;
use axum::extract::{Path, Request, State};
use axum::http::header::REFERER;
use axum::response::Response;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Instant;
use waffle_core::{EventFields, EventKind, abbreviate_commit};

/// Characters escaped when an asset name is put back into a path.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Path parameters of the dataset routes. Absent segments are `None`.
#[derive(Debug, Default, Deserialize)]
pub struct DataPath {
    pub slug: Option<String>,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub asset: Option<String>,
}

/// Which route family a request came through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Surface {
    /// `/{slug}/...`
    QueryV1,
    /// `/v2/{slug}/...`
    QueryV2,
    /// `/info/{slug}/...`
    Info,
    /// `/v2/{slug}/.../assets/{asset}`
    Asset,
}

impl Surface {
    fn kind(self) -> EventKind {
        match self {
            Self::QueryV1 | Self::QueryV2 => EventKind::Query,
            Self::Info => EventKind::Info,
            Self::Asset => EventKind::Asset,
        }
    }

    fn prefix(self, slug: &str) -> String {
        match self {
            Self::QueryV1 => format!("/{slug}/"),
            Self::QueryV2 | Self::Asset => format!("/v2/{slug}/"),
            Self::Info => format!("/info/{slug}/"),
        }
    }

    fn takes_query(self) -> bool {
        matches!(self, Self::QueryV1 | Self::QueryV2)
    }
}

/// GET /v2
pub async fn query_root(State(state): State<AppState>, req: Request) -> Response {
    serve(state, Surface::QueryV2, DataPath::default(), req).await
}

/// GET /v2/{slug}[/{branch}[/{commit}]]
pub async fn query_v2(
    State(state): State<AppState>,
    Path(path): Path<DataPath>,
    req: Request,
) -> Response {
    serve(state, Surface::QueryV2, path, req).await
}

/// GET /{slug}[/{branch}[/{commit}]]
pub async fn query_v1(
    State(state): State<AppState>,
    Path(path): Path<DataPath>,
    req: Request,
) -> Response {
    serve(state, Surface::QueryV1, path, req).await
}

/// GET /info
pub async fn info_root(State(state): State<AppState>, req: Request) -> Response {
    serve(state, Surface::Info, DataPath::default(), req).await
}

/// GET /info/{slug}[/{branch}[/{commit}]]
pub async fn info(
    State(state): State<AppState>,
    Path(path): Path<DataPath>,
    req: Request,
) -> Response {
    serve(state, Surface::Info, path, req).await
}

/// GET /v2/{slug}[/{branch}[/{commit}]]/assets/{asset}
pub async fn asset(
    State(state): State<AppState>,
    Path(path): Path<DataPath>,
    req: Request,
) -> Response {
    serve(state, Surface::Asset, path, req).await
}

async fn serve(state: AppState, surface: Surface, path: DataPath, req: Request) -> Response {
    let started = Instant::now();
    let requester = get_requester(&req);
    let raw_query = req.uri().query().unwrap_or_default().to_string();
    let referer = req
        .headers()
        .get(REFERER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let outcome = answer(&state, surface, &path, &requester, &raw_query).await;
    let elapsed = started.elapsed();

    let kind = surface.kind();
    let mut fields = EventFields::new(kind, path.slug.unwrap_or_default());
    fields.asset = path.asset.unwrap_or_default();
    fields.branch = path.branch.unwrap_or_default();
    fields.commit = path.commit.unwrap_or_default();
    fields.query_string = raw_query;
    fields.referer = referer;
    fields.status = outcome.status().as_u16();
    match &outcome {
        Outcome::Error(e) => fields.comment = e.code().to_string(),
        Outcome::Redirect { location, .. } => fields.comment = location.clone(),
        Outcome::Success { .. } => {
            fields.timing_ms = Some(elapsed.as_secs_f64() * 1000.0);
            if kind == EventKind::Query {
                metrics::QUERY_DURATION.observe(elapsed.as_secs_f64());
            }
        }
    }
    let status = fields.status;
    state.ledger.record(fields);
    metrics::record_request(kind.as_str(), status);

    outcome.render(&state.config.cache_control, state.base_url())
}

/// Resolve the request and, once it names a synced version, ask the reader.
async fn answer(
    state: &AppState,
    surface: Surface,
    path: &DataPath,
    requester: &Requester,
    raw_query: &str,
) -> Outcome {
    let control = state.registry.current();
    let resolver = Resolver {
        datasets: &control.datasets,
        versions: &state.versions,
        access: &state.access,
    };

    let located = match resolver.locate(requester, path.slug.as_deref()) {
        Ok(located) => located,
        Err(detour) => return detour.into(),
    };
    let slug = located.dataset.slug.clone();

    let parsed = if surface.takes_query() {
        match query::parse(raw_query) {
            Ok(parsed) => Some(parsed),
            Err(QueryError::Missing) => return Outcome::Error(ApiError::NoQueryProvided { slug }),
            Err(e) => {
                tracing::debug!(slug = %slug, error = %e, "Query rejected");
                return Outcome::Error(ApiError::QueryParsingError { slug });
            }
        }
    } else {
        None
    };

    let mut shape = RedirectShape::new(surface.prefix(&slug)).with_query(Some(raw_query));
    let asset = if surface == Surface::Asset {
        let Some(asset) = path.asset.as_deref().filter(|a| !a.is_empty()) else {
            return Outcome::Error(ApiError::AssetNotProvided);
        };
        let encoded = utf8_percent_encode(asset, PATH_SEGMENT).to_string();
        shape = shape.with_suffix(format!("/assets/{encoded}"));
        Some(encoded)
    } else {
        None
    };

    let version = match resolver.resolve_version(
        located,
        path.branch.as_deref(),
        path.commit.as_deref(),
        &shape,
    ) {
        Ok(version) => version,
        Err(detour) => return detour.into(),
    };

    if let Some(asset) = asset {
        return Outcome::Redirect {
            location: format!(
                "/{}/{}/assets/{asset}",
                version.dataset.repo_id, version.branch
            ),
            cache: CacheDirective::Immutable,
        };
    }

    let Some(reader) = state.readers.get(&slug, &version.branch) else {
        return Outcome::Error(ApiError::NoReaderInstance {
            commit: abbreviate_commit(&version.commit).to_string(),
            branch: version.branch,
            slug,
        });
    };

    let result = match &parsed {
        Some(parsed) => reader.read(parsed).await.map(|mut body| {
            // Query results name the commit they were requested at
            if let Some(fields) = body.as_object_mut() {
                let given = path.commit.clone().unwrap_or_default();
                fields.insert("version".to_string(), Value::String(given));
            }
            body
        }),
        None => reader.info().await,
    };
    match result {
        Ok(body) => Outcome::success(body),
        Err(e) => {
            let e = ApiError::from(e);
            if e.status_code().is_server_error() {
                tracing::error!(slug = %slug, branch = %version.branch, error = ?e, "Reader failed");
            }
            Outcome::Error(e)
        }
    }
}
