use crate::errors::{ApiError, ApiResult};
use crate::executor::{Executor, StartError};
use crate::metrics::MetricsCollector;
use crate::store::JobStore;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tokio_util::io::ReaderStream;
use common::{
    CancelResponse, Catalog, ConfigResponse, JobSnapshot, JobSummary, MessageResponse,
    StartScanRequest, StartScanResponse,
};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<JobStore>,
    pub executor: Arc<Executor>,
    pub catalog: Arc<Catalog>,
    pub metrics: Arc<MetricsCollector>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/config", get(get_config))
        .route("/api/scan/start", post(start_scan))
        .route("/api/scan/status/{job_id}", get(scan_status))
        .route("/api/scan/cancel/{job_id}", post(cancel_scan))
        .route("/api/scan/delete/{job_id}", delete(delete_scan))
        .route("/api/jobs", get(list_jobs))
        .route("/api/results/download/{job_id}", get(download_results))
        .route("/metrics", get(export_metrics))
        .with_state(state)
}

async fn get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        tools: state.catalog.tools.clone(),
        profiles: state.catalog.profiles.clone(),
        phases: state.catalog.phases.clone(),
    })
}

async fn start_scan(
    State(state): State<AppState>,
    Json(req): Json<StartScanRequest>,
) -> ApiResult<Json<StartScanResponse>> {
    let job_id = state.executor.start_scan(req).await.map_err(|e| match e {
        StartError::Validation(msg) => ApiError::bad_request(msg),
        StartError::Internal(err) => {
            log::error!("Failed to start scan: {:#}", err);
            ApiError::internal("Failed to start scan")
        }
    })?;
    Ok(Json(StartScanResponse {
        message: format!("Scan job {} started.", job_id),
        job_id,
    }))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    #[serde(default)]
    log_offset: usize,
}

async fn scan_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<JobSnapshot>> {
    state
        .store
        .snapshot(&job_id, query.log_offset)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Job {} not found", job_id)))
}

async fn cancel_scan(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let status = state
        .executor
        .request_cancel(&job_id)
        .ok_or_else(|| ApiError::not_found(format!("Job {} not found", job_id)))?;
    let message = if status.is_terminal() {
        format!("Job {} already finished with status {}.", job_id, status)
    } else {
        format!("Cancellation requested for job {}.", job_id)
    };
    Ok(Json(CancelResponse { message, status }))
}

async fn delete_scan(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    if let Some(status) = state.store.status(&job_id) {
        if status.is_active() {
            return Err(ApiError::conflict(format!(
                "Job {} is still {}; cancel it before deleting",
                job_id, status
            )));
        }
    }
    let removed = state.store.delete(&job_id).map_err(|e| {
        log::error!("Failed to delete job {}: {:#}", job_id, e);
        ApiError::internal("Failed to delete job")
    })?;
    if !removed {
        return Err(ApiError::not_found(format!("Job {} not found", job_id)));
    }
    Ok(Json(MessageResponse {
        message: format!("Job {} and its data were deleted.", job_id),
    }))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobSummary>> {
    Json(state.store.list())
}

async fn download_results(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if !state.store.contains(&job_id) {
        return Err(ApiError::not_found(format!("Job {} not found", job_id)));
    }
    let zip_path = state
        .store
        .zip_file_for(&job_id)
        .ok_or_else(|| ApiError::not_found("No results archive for this job"))?;
    // Archives can be large; stream from disk instead of buffering.
    let file = tokio::fs::File::open(&zip_path).await.map_err(|e| {
        log::error!("Archive {:?} missing on disk: {}", zip_path, e);
        ApiError::not_found("Results archive is missing on the server")
    })?;

    let file_name = zip_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}_results.zip", job_id));
    let headers = [
        (header::CONTENT_TYPE, "application/zip".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file_name),
        ),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))))
}

async fn export_metrics(State(state): State<AppState>) -> String {
    state.metrics.export()
}
