//! Sync triggers and git worker introspection.

use super::require_server_level;
use crate::access::Requester;
use crate::auth::get_requester;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::sync::{SyncAuthority, SyncScope};
use axum::Json;
use axum::extract::{Path, Request, State};
use serde::Serialize;
use waffle_core::{AccessLevel, JobId, SyncStatus};
use waffle_git::JobSnapshot;

/// Check that `requester` may run `scope` before anything starts.
fn authorize_sync(state: &AppState, requester: &Requester, scope: &SyncScope) -> ApiResult<()> {
    let datasets = state.registry.datasets();
    match scope {
        SyncScope::All => {
            if state.access.editable_datasets(requester, &datasets).is_empty() {
                return Err(ApiError::SyncUnauthorized {
                    target: "any dataset".to_string(),
                });
            }
        }
        SyncScope::Dataset(slug) | SyncScope::Branch(slug, _) => {
            let dataset = datasets
                .get(slug)
                .ok_or_else(|| ApiError::DatasetNotConfigured { slug: slug.clone() })?;
            if let SyncScope::Branch(_, branch) = scope
                && !dataset.has_branch(branch)
            {
                return Err(ApiError::BranchNotConfigured {
                    slug: slug.clone(),
                    branch: branch.clone(),
                });
            }
            if !state.access.can_edit(requester, slug) {
                return Err(ApiError::SyncUnauthorized {
                    target: scope.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn start_sync(state: &AppState, req: &Request, scope: SyncScope) -> ApiResult<Json<SyncStatus>> {
    let requester = get_requester(req);
    authorize_sync(state, &requester, &scope)?;
    tracing::info!(%scope, user = ?requester.user, "Sync requested");
    Ok(Json(state.sync.sync_if_not_already_syncing(
        scope,
        SyncAuthority::Requester(requester),
    )))
}

/// GET /sync
pub async fn sync_all(State(state): State<AppState>, req: Request) -> ApiResult<Json<SyncStatus>> {
    start_sync(&state, &req, SyncScope::All)
}

/// GET /sync/{slug}
pub async fn sync_dataset(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    req: Request,
) -> ApiResult<Json<SyncStatus>> {
    start_sync(&state, &req, SyncScope::Dataset(slug))
}

/// GET /sync/{slug}/{branch}
pub async fn sync_branch(
    State(state): State<AppState>,
    Path((slug, branch)): Path<(String, String)>,
    req: Request,
) -> ApiResult<Json<SyncStatus>> {
    start_sync(&state, &req, SyncScope::Branch(slug, branch))
}

/// GET /syncprogress
pub async fn sync_progress(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<SyncStatus>> {
    require_server_level(&state, &get_requester(&req), AccessLevel::Reader, "view sync progress")?;
    Ok(Json(state.sync.status()))
}

/// GET /gitjobs
pub async fn list_git_jobs(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<Vec<JobSnapshot>>> {
    require_server_level(&state, &get_requester(&req), AccessLevel::Reader, "view git jobs")?;
    Ok(Json(state.worker.list().await?))
}

fn parse_job_id(raw: &str) -> ApiResult<JobId> {
    JobId::parse(raw).map_err(|_| ApiError::NotFound(format!("git job {raw}")))
}

/// GET /gitjobs/{job_id}
pub async fn get_git_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    req: Request,
) -> ApiResult<Json<JobSnapshot>> {
    require_server_level(&state, &get_requester(&req), AccessLevel::Reader, "view git jobs")?;
    let id = parse_job_id(&job_id)?;
    state
        .worker
        .status(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("git job {id}")))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    /// False when the job was not queued (running, finished or unknown).
    pub canceled: bool,
}

/// POST /gitjobs/{job_id}/cancel
pub async fn cancel_git_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    req: Request,
) -> ApiResult<Json<CancelResponse>> {
    require_server_level(&state, &get_requester(&req), AccessLevel::Owner, "cancel git jobs")?;
    let id = parse_job_id(&job_id)?;
    let canceled = state.worker.cancel(&id).await?;
    tracing::info!(job = %id, canceled, "Git job cancel requested");
    Ok(Json(CancelResponse {
        job_id: id,
        canceled,
    }))
}
