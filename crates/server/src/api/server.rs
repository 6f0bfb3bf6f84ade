use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use time::OffsetDateTime;

use crate::state::{flag, AppState, FlushParams, HealthResponse, JsonResult};
use crate::utils::json_error;

pub async fn flush_cache(
    State(state): State<AppState>,
    Query(params): Query<FlushParams>,
) -> JsonResult<HealthResponse> {
    let only_memory = flag(&params.only_memory);
    let catalog = state.catalog.clone();
    tokio::task::spawn_blocking(move || catalog.flush_cache(only_memory))
        .await
        .map_err(|err| json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:?}", err)))?
        .map_err(|err| json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(HealthResponse { status: "ok" }))
}

/// Server clock in Unix nanoseconds, for clients that sync incrementally.
pub async fn now() -> String {
    common::unix_nanos(OffsetDateTime::now_utc()).to_string()
}
