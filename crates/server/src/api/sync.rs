use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common::{ReindexPage, Song};
use time::OffsetDateTime;
use tracing::error;

use crate::catalog::ImportError;
use crate::export::{render_ndjson, ExportPage, Omit, SongExport};
use crate::state::{
    flag, AppState, ErrorResponse, ExportParams, ImportParams, ImportResponse, JsonResult,
    ReindexParams, SongIdParams,
};
use crate::utils::{blocking, json_error, store_error};

const REINDEX_BATCH: usize = 400;

/// Merges a stream of JSON songs in order. The first bad or failing song ends
/// the request; songs before it stay merged.
pub async fn import(
    State(state): State<AppState>,
    Query(params): Query<ImportParams>,
    body: Bytes,
) -> JsonResult<ImportResponse> {
    let replace = flag(&params.replace_user_data);
    let delay = Duration::from_nanos(params.update_delay_nsec.unwrap_or(0));
    let catalog = state.catalog.clone();
    let imported = tokio::task::spawn_blocking(move || {
        let songs = serde_json::Deserializer::from_slice(&body).into_iter::<Song>();
        catalog.import(songs, replace, delay)
    })
    .await
    .map_err(|err| json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:?}", err)))?
    .map_err(|err| {
        error!("Import failed: {}", err);
        match err {
            ImportError::Decode { .. } => json_error(StatusCode::BAD_REQUEST, err.to_string()),
            ImportError::Store { source, .. } => store_error(source),
        }
    })?;
    Ok(Json(ImportResponse { imported }))
}

pub async fn export(
    State(state): State<AppState>,
    Query(params): Query<ExportParams>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let cursor = params.cursor.clone().unwrap_or_default();
    let catalog = state.catalog.clone();
    let body = match params.kind.as_deref() {
        Some("song") => {
            let min_last_modified = match params.min_last_modified_nsec {
                Some(ns) if ns > 0 => Some(
                    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ns)).map_err(|err| {
                        json_error(StatusCode::BAD_REQUEST, format!("bad minLastModifiedNsec: {}", err))
                    })?,
                ),
                _ => None,
            };
            let request = SongExport {
                cursor,
                deleted: flag(&params.deleted),
                min_last_modified,
                max: params.max,
                omit: Omit::parse(params.omit.as_deref().unwrap_or("")),
            };
            let page = blocking(move || catalog.export_songs(&request)).await?;
            render(&page)?
        }
        Some("play") => {
            let max = params.max;
            let page = blocking(move || catalog.export_plays(&cursor, max)).await?;
            render(&page)?
        }
        _ => return Err(json_error(StatusCode::BAD_REQUEST, "invalid type")),
    };
    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response())
}

fn render<T: serde::Serialize>(
    page: &ExportPage<T>,
) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    render_ndjson(page)
        .map_err(|err| json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:?}", err)))
}

pub async fn dump_song(
    State(state): State<AppState>,
    Query(params): Query<SongIdParams>,
) -> JsonResult<Song> {
    let catalog = state.catalog.clone();
    let song = blocking(move || catalog.dump_song(params.song_id)).await?;
    Ok(Json(song))
}

pub async fn delete_song(
    State(state): State<AppState>,
    Query(params): Query<SongIdParams>,
) -> JsonResult<Song> {
    let catalog = state.catalog.clone();
    let record = blocking(move || catalog.delete_song(params.song_id)).await?;
    Ok(Json(record.to_song(Vec::new())))
}

pub async fn reindex(
    State(state): State<AppState>,
    Query(params): Query<ReindexParams>,
) -> JsonResult<ReindexPage> {
    let cursor = params.cursor.unwrap_or_default();
    let catalog = state.catalog.clone();
    let (scanned, updated, cursor) =
        blocking(move || catalog.reindex(&cursor, REINDEX_BATCH)).await?;
    Ok(Json(ReindexPage {
        scanned,
        updated,
        cursor,
    }))
}
