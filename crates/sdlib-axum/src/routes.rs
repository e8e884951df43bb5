//! Route definitions and router construction.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// All API routes without the `/api` prefix (nested by the caller).
pub(crate) fn api_routes() -> Router<AppState> {
    Router::new()
        // Jobs API
        .route("/jobs/generate", post(handlers::jobs::generate))
        .route("/jobs/edit", post(handlers::jobs::edit))
        .route("/jobs/variation", post(handlers::jobs::variation))
        .route("/jobs/upscale", post(handlers::jobs::upscale))
        .route("/jobs", get(handlers::jobs::list))
        .route(
            "/jobs/{id}",
            get(handlers::jobs::get).delete(handlers::jobs::cancel),
        )
        // Generations API
        .route("/generations/{id}", get(handlers::jobs::generation))
        .route(
            "/generations/{id}/images",
            get(handlers::jobs::generation_images),
        )
        .route("/images/{id}", get(handlers::images::get))
        // Models API
        .route("/models", get(handlers::models::list))
        .route("/models/running", get(handlers::models::running))
        // Downloads API (registered before the {id} captures)
        .route(
            "/models/download",
            post(handlers::downloads::start).get(handlers::downloads::list),
        )
        .route(
            "/models/download/{id}",
            get(handlers::downloads::status).delete(handlers::downloads::cancel),
        )
        .route(
            "/models/download/{id}/pause",
            post(handlers::downloads::pause),
        )
        .route(
            "/models/download/{id}/resume",
            post(handlers::downloads::resume),
        )
        .route("/models/{id}", get(handlers::models::get))
        .route("/models/{id}/status", get(handlers::models::status))
        .route("/models/{id}/start", post(handlers::models::start))
        .route("/models/{id}/stop", post(handlers::models::stop))
        .route("/models/{id}/logs", get(handlers::models::logs))
        // Real-time events (WebSocket with topic subscriptions)
        .route("/events", get(ws::events))
}

/// Create the main router with the `/api` nest and a liveness endpoint.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_routes().with_state(state).layer(cors))
}

/// Health check endpoint.
pub(crate) async fn health_check() -> &'static str {
    "OK"
}
