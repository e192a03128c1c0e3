use crate::server::AppState;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/pause", post(pause))
        .route("/api/v1/resume", post(resume))
        .route("/api/v1/latency/reset", post(reset_latency))
        .route("/api/v1/shutdown", post(shutdown))
}

#[tracing::instrument(level = "info", skip_all)]
async fn pause(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let outcome = state.responder.pause();
    Json(serde_json::json!({
        "status": "ok",
        "paused": true,
        "was_paused": outcome.was_paused,
        "discarded": outcome.discarded,
    }))
}

#[tracing::instrument(level = "info", skip_all)]
async fn resume(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let was_paused = state.responder.resume();
    Json(serde_json::json!({
        "status": "ok",
        "paused": false,
        "was_paused": was_paused,
    }))
}

#[tracing::instrument(level = "info", skip_all)]
async fn reset_latency(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let cleared = state.responder.reset_latency();
    Json(serde_json::json!({
        "status": "ok",
        "cleared": cleared,
    }))
}

#[tracing::instrument(level = "info", skip_all)]
async fn shutdown(
    Extension(state): Extension<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    tracing::warn!("shutdown requested over control api");
    state.shutdown.cancel();
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "shutting_down" })),
    )
}
