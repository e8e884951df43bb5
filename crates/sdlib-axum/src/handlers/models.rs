//! Model endpoints: configuration, status, and lifecycle control.

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use sdlib_core::ModelDescriptor;
use sdlib_runtime::{ModelStatus, ProcessRecord, StartOptions};

use crate::error::HttpError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct StopResponse {
    pub stopped: bool,
}

/// `GET /models`: every configured descriptor.
pub async fn list(State(state): State<AppState>) -> Json<Vec<ModelDescriptor>> {
    Json(state.manager.all().to_vec())
}

/// `GET /models/{id}`.
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ModelDescriptor>, HttpError> {
    state
        .manager
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| HttpError::NotFound(format!("model {id}")))
}

/// `GET /models/{id}/status`.
pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ModelStatus>, HttpError> {
    Ok(Json(state.manager.status(&id)?))
}

/// `POST /models/{id}/start`.
pub async fn start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProcessRecord>, HttpError> {
    let record = state.manager.start(&id, StartOptions::default()).await?;
    Ok(Json(record))
}

/// `POST /models/{id}/stop`.
pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StopResponse>, HttpError> {
    let stopped = state.manager.stop(&id).await?;
    Ok(Json(StopResponse { stopped }))
}

/// `GET /models/running`: ids with a live engine process.
pub async fn running(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.manager.running())
}

/// `GET /models/{id}/logs`: captured engine output for diagnostics.
pub async fn logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<String>>, HttpError> {
    let status = state.manager.status(&id)?;
    let lines = status
        .port
        .map(|port| state.manager.engine_logs(port))
        .unwrap_or_default();
    Ok(Json(lines))
}
