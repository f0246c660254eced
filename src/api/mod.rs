// dbbackup/src/api/mod.rs
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::backup::ArtifactDescriptor;
use crate::errors::BackupError;
use crate::recorder::ScheduleStatus;
use crate::restore::RestoreReport;
use crate::schedule::{BackupSchedule, ScheduleRequest};
use crate::service::BackupService;
use crate::store::BackupRecord;

pub type AppState = Arc<BackupService>;

#[derive(Debug)]
pub enum ApiError {
    Backup(BackupError),
    InvalidRequest(String),
    NotFound(String),
}

impl From<BackupError> for ApiError {
    fn from(err: BackupError) -> Self {
        ApiError::Backup(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidRequest(rejection.body_text())
    }
}

fn status_for(err: &BackupError) -> StatusCode {
    match err {
        BackupError::ScheduleConfig(_) => StatusCode::BAD_REQUEST,
        BackupError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
        BackupError::RunInProgress(_) => StatusCode::CONFLICT,
        BackupError::NotAuthorized => StatusCode::UNAUTHORIZED,
        BackupError::Upload(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Backup(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    error!(error = %err, kind = err.kind(), "Request failed");
                }
                (status, err.kind(), err.to_string())
            }
            ApiError::InvalidRequest(message) => (StatusCode::BAD_REQUEST, "invalid_request", message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
        };
        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct CreateBackupRequest {
    pub owner: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ArtifactQuery {
    pub artifact_id: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub artifact_id: String,
    #[serde(default)]
    pub confirm_overwrite: bool,
}

#[derive(Debug, Serialize)]
pub struct Deleted {
    pub deleted: String,
}

pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/schedules", put(upsert_schedule))
        .route("/schedules/:owner", get(schedule_status).delete(delete_schedule))
        .route("/backups", post(create_backup).delete(delete_backup))
        .route("/history", get(history))
        .route("/restore", post(restore))
        .with_state(service)
}

/// Serves until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    service: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "HTTP API listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn upsert_schedule(
    State(service): State<AppState>,
    payload: Result<Json<ScheduleRequest>, JsonRejection>,
) -> ApiResult<BackupSchedule> {
    let Json(request) = payload?;
    Ok(Json(service.upsert_schedule(&request).await?))
}

async fn schedule_status(
    State(service): State<AppState>,
    Path(owner): Path<String>,
) -> ApiResult<ScheduleStatus> {
    Ok(Json(service.status(&owner).await?))
}

async fn delete_schedule(
    State(service): State<AppState>,
    Path(owner): Path<String>,
) -> ApiResult<Deleted> {
    if service.delete_schedule(&owner).await? {
        Ok(Json(Deleted { deleted: owner }))
    } else {
        Err(ApiError::NotFound(format!("no backup schedule for '{}'", owner)))
    }
}

async fn create_backup(
    State(service): State<AppState>,
    body: Bytes,
) -> ApiResult<ArtifactDescriptor> {
    // An empty body is an anonymous run; anything else must parse.
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        CreateBackupRequest::default()
    } else {
        serde_json::from_slice::<CreateBackupRequest>(&body)
            .map_err(|e| ApiError::InvalidRequest(format!("invalid backup request: {}", e)))?
    };
    let owner = request
        .owner
        .map(|o| o.trim().to_string())
        .filter(|o| !o.is_empty());
    Ok(Json(service.create_backup(owner).await?))
}

async fn delete_backup(
    State(service): State<AppState>,
    Query(query): Query<ArtifactQuery>,
) -> ApiResult<Deleted> {
    service.delete_artifact(&query.artifact_id).await?;
    Ok(Json(Deleted {
        deleted: query.artifact_id,
    }))
}

async fn history(
    State(service): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<BackupRecord>> {
    Ok(Json(service.history(query.limit).await?))
}

/// Overwrites the whole database; callers must opt in with `confirm_overwrite`.
async fn restore(
    State(service): State<AppState>,
    payload: Result<Json<RestoreRequest>, JsonRejection>,
) -> ApiResult<RestoreReport> {
    let Json(request) = payload?;
    if !request.confirm_overwrite {
        return Err(ApiError::InvalidRequest(
            "restore replaces the entire database; set confirm_overwrite to true".to_string(),
        ));
    }
    Ok(Json(service.restore(&request.artifact_id).await?))
}
