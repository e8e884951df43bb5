//! Model download endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sdlib_core::{DownloadJob, DownloadStatus};

use crate::error::HttpError;
use crate::state::AppState;

/// Request to start a registry download. An empty or omitted file list
/// fetches everything the repository lists.
#[derive(Debug, Deserialize)]
pub struct StartDownloadRequest {
    pub repo: String,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DownloadAccepted {
    pub download_id: Uuid,
    pub status: DownloadStatus,
}

/// `POST /models/download`.
pub async fn start(
    State(state): State<AppState>,
    Json(req): Json<StartDownloadRequest>,
) -> Result<Json<DownloadAccepted>, HttpError> {
    if req.repo.trim().is_empty() {
        return Err(HttpError::BadRequest("repo is required".to_string()));
    }
    let download_id = state.downloads.start(&req.repo, req.files).await?;
    Ok(Json(DownloadAccepted {
        download_id,
        status: DownloadStatus::Downloading,
    }))
}

/// `GET /models/download`: every download record, newest first.
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<DownloadJob>>, HttpError> {
    Ok(Json(state.downloads.all().await?))
}

/// `GET /models/download/{id}`: aggregated view with live speed.
pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DownloadJob>, HttpError> {
    Ok(Json(state.downloads.status(id).await?))
}

/// `DELETE /models/download/{id}`: cancel the download.
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(), HttpError> {
    state.downloads.cancel(id).await?;
    Ok(())
}

/// `POST /models/download/{id}/pause`.
pub async fn pause(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(), HttpError> {
    state.downloads.pause(id).await?;
    Ok(())
}

/// `POST /models/download/{id}/resume`.
pub async fn resume(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(), HttpError> {
    state.downloads.resume(id).await?;
    Ok(())
}
