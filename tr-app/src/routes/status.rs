use crate::responder::ResponderStatus;
use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/status", get(get_status))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_status(Extension(state): Extension<Arc<AppState>>) -> Json<ResponderStatus> {
    Json(state.responder.status().await)
}
