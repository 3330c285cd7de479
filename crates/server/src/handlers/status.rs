//! Health, server status and dataset listing.

use super::require_server_level;
use crate::auth::get_requester;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Request, State};
use serde::Serialize;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use waffle_core::{AccessLevel, BranchCommits, DatasetControlList};

/// Value of `server.type` in status responses.
pub const SERVER_TYPE: &str = "small-waffle";

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    /// Resident set size, where the platform reports it.
    pub rss_bytes: Option<u64>,
    pub ledger_records: usize,
    pub readers: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "uptime_ms")]
    pub uptime_ms: u128,
    #[serde(with = "time::serde::rfc3339")]
    pub live_since: OffsetDateTime,
    pub memory: MemoryStats,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub server: ServerInfo,
    pub dataset_control_list: DatasetControlList,
    pub available_datasets: BTreeMap<String, BranchCommits>,
}

/// Resident set size from `/proc/self/status`.
fn resident_set_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

/// Branch-commit maps of the datasets in `visible`.
fn visible_versions(
    state: &AppState,
    visible: &DatasetControlList,
) -> BTreeMap<String, BranchCommits> {
    state
        .versions
        .snapshot()
        .into_iter()
        .filter(|(slug, _)| visible.contains(slug))
        .collect()
}

/// GET /status
pub async fn status(State(state): State<AppState>, req: Request) -> ApiResult<Json<StatusResponse>> {
    let requester = get_requester(&req);
    require_server_level(&state, &requester, AccessLevel::Reader, "view the server status")?;

    let visible = state
        .access
        .visible_datasets(&requester, &state.registry.datasets());
    let available_datasets = visible_versions(&state, &visible);

    Ok(Json(StatusResponse {
        server: ServerInfo {
            kind: SERVER_TYPE,
            uptime_ms: state.uptime_ms(),
            live_since: state.live_since,
            memory: MemoryStats {
                rss_bytes: resident_set_bytes(),
                ledger_records: state.ledger.len(),
                readers: state.readers.count(),
            },
            version: env!("CARGO_PKG_VERSION"),
        },
        dataset_control_list: visible,
        available_datasets,
    }))
}

/// GET /status/{slug}
///
/// Datasets the requester cannot see are reported as missing.
pub async fn status_dataset(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    req: Request,
) -> ApiResult<Json<BranchCommits>> {
    let requester = get_requester(&req);
    require_server_level(&state, &requester, AccessLevel::Reader, "view the server status")?;

    let not_found = || ApiError::NotFound(format!("dataset {slug}"));
    let datasets = state.registry.datasets();
    let dataset = datasets.get(&slug).ok_or_else(not_found)?;
    if !state.access.can_view(&requester, dataset) {
        return Err(not_found());
    }
    state.versions.branches(&slug).map(Json).ok_or_else(not_found)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetsResponse {
    pub dataset_control_list: DatasetControlList,
    pub dataset_branch_commit_mapping: BTreeMap<String, BranchCommits>,
    #[serde(rename = "totalDCLCount")]
    pub total_dcl_count: usize,
    #[serde(rename = "totalBCMCount")]
    pub total_bcm_count: usize,
}

/// GET /datasets
///
/// Lists what the requester can see; the totals count everything.
pub async fn datasets(State(state): State<AppState>, req: Request) -> Json<DatasetsResponse> {
    let requester = get_requester(&req);
    let all = state.registry.datasets();
    let visible = state.access.visible_datasets(&requester, &all);

    Json(DatasetsResponse {
        dataset_branch_commit_mapping: visible_versions(&state, &visible),
        dataset_control_list: visible,
        total_dcl_count: all.len(),
        total_bcm_count: state.versions.len(),
    })
}
