pub mod server;
pub mod songs;
pub mod sync;

use axum::{
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::state::{AppState, HealthResponse};

pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/import", post(sync::import))
        .route("/export", get(sync::export))
        .route("/dump_song", get(sync::dump_song))
        .route("/delete_song", post(sync::delete_song))
        .route("/reindex", post(sync::reindex))
        .route("/played", post(songs::played))
        .route("/rate_and_tag", post(songs::rate_and_tag))
        .route("/tags", get(songs::tags))
        .route("/query", get(songs::query))
        .route("/flush_cache", post(server::flush_cache))
        .route("/now", get(server::now))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}
