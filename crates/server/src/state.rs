use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Catalog,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ImportResponse {
    pub imported: usize,
}

#[derive(Serialize)]
pub struct PlayedResponse {
    pub added: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportParams {
    pub replace_user_data: Option<String>,
    pub update_delay_nsec: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportParams {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub cursor: Option<String>,
    pub deleted: Option<String>,
    pub min_last_modified_nsec: Option<i64>,
    pub max: Option<usize>,
    pub omit: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongIdParams {
    pub song_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateAndTagParams {
    pub song_id: u64,
    pub rating: Option<f64>,
    pub tags: Option<String>,
    pub update_delay_nsec: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayedParams {
    pub song_id: u64,
    pub start_time: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    pub artist: Option<String>,
    pub title: Option<String>,
    pub album: Option<String>,
    pub album_id: Option<String>,
    pub keywords: Option<String>,
    pub min_rating: Option<f64>,
    pub unrated: Option<String>,
    pub max_plays: Option<u32>,
    pub min_first_played: Option<String>,
    pub max_last_played: Option<String>,
    pub first_track: Option<String>,
    pub track: Option<u32>,
    pub disc: Option<u32>,
    pub max_disc: Option<u32>,
    /// Space-separated; a leading '-' negates a tag.
    pub tags: Option<String>,
    pub shuffle: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushParams {
    pub only_memory: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReindexParams {
    pub cursor: Option<String>,
}

pub type JsonResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

/// Boolean query flags are sent as `1`.
pub fn flag(value: &Option<String>) -> bool {
    value.as_deref() == Some("1")
}
