//! Event ledger endpoints.

use super::require_server_level;
use crate::access::Requester;
use crate::auth::get_requester;
use crate::error::ApiResult;
use crate::ledger::{BackupOutcome, DEFAULT_BACKUP_NAME, validate_backup_name};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Request, State};
use serde::Serialize;
use waffle_core::{AccessLevel, EventRecord};

#[derive(Debug, Serialize)]
pub struct BackupResponse {
    /// Name the backup was written under, absent when skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
    /// An overlapping backup was in progress.
    pub skipped: bool,
    pub records: usize,
}

impl BackupResponse {
    fn new(outcome: BackupOutcome, records: usize) -> Self {
        match outcome {
            BackupOutcome::Written { name, .. } => Self {
                backup: Some(name),
                skipped: false,
                records,
            },
            BackupOutcome::Skipped => Self {
                backup: None,
                skipped: true,
                records,
            },
        }
    }
}

/// GET /events
pub async fn events(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<Vec<EventRecord>>> {
    require_server_level(&state, &get_requester(&req), AccessLevel::Reader, "view events")?;
    Ok(Json(state.ledger.retrieve_all()))
}

async fn backup(
    state: &AppState,
    requester: &Requester,
    name: &str,
    timestamped: bool,
) -> ApiResult<Json<BackupResponse>> {
    require_server_level(state, requester, AccessLevel::Owner, "back up events")?;
    let records = state.ledger.len();
    let outcome = state.ledger.backup(name, timestamped).await?;
    Ok(Json(BackupResponse::new(outcome, records)))
}

/// GET /backupevents
///
/// Writes a timestamped `manual-backup`.
pub async fn backup_events(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<BackupResponse>> {
    let requester = get_requester(&req);
    backup(&state, &requester, DEFAULT_BACKUP_NAME, true).await
}

/// GET /backupevents/{name}
///
/// Writes `{name}` suffixed with the current time, so repeated backups under
/// one name never overwrite each other.
pub async fn backup_events_named(
    State(state): State<AppState>,
    Path(name): Path<String>,
    req: Request,
) -> ApiResult<Json<BackupResponse>> {
    let requester = get_requester(&req);
    backup(&state, &requester, &name, true).await
}

#[derive(Debug, Serialize)]
pub struct RestoreResponse {
    pub backup: String,
    pub records: usize,
}

/// GET /restoreevents/{name}
pub async fn restore_events(
    State(state): State<AppState>,
    Path(name): Path<String>,
    req: Request,
) -> ApiResult<Json<RestoreResponse>> {
    require_server_level(&state, &get_requester(&req), AccessLevel::Owner, "restore events")?;
    validate_backup_name(&name)?;
    let records = state.ledger.restore(&name).await?;
    Ok(Json(RestoreResponse {
        backup: name,
        records,
    }))
}

/// GET /resetevents
///
/// Clears the ledger after a pre-reset backup; fails without clearing if
/// that backup cannot be written.
pub async fn reset_events(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<BackupResponse>> {
    require_server_level(&state, &get_requester(&req), AccessLevel::Owner, "reset events")?;
    let records = state.ledger.len();
    let outcome = state.ledger.reset().await?;
    Ok(Json(BackupResponse::new(outcome, records)))
}
