use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Query, State},
    http::StatusCode,
    Json,
};
use common::{Play, Song};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::query::SongQuery;
use crate::state::{
    flag, AppState, JsonResult, PlayedParams, PlayedResponse, QueryParams, RateAndTagParams,
};
use crate::utils::{blocking, json_error};

pub async fn played(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<PlayedParams>,
) -> JsonResult<PlayedResponse> {
    let start_time = parse_time("startTime", &params.start_time)?;
    let play = Play::new(start_time, addr.ip().to_string());
    let catalog = state.catalog.clone();
    let added = blocking(move || catalog.add_play(params.song_id, &play)).await?;
    Ok(Json(PlayedResponse { added }))
}

pub async fn rate_and_tag(
    State(state): State<AppState>,
    Query(params): Query<RateAndTagParams>,
) -> JsonResult<Song> {
    if params.rating.is_none() && params.tags.is_none() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "no rating or tags supplied",
        ));
    }
    if params.rating.is_some_and(f64::is_nan) {
        return Err(json_error(StatusCode::BAD_REQUEST, "bad rating"));
    }
    let tags: Option<Vec<String>> = params
        .tags
        .as_deref()
        .map(|tags| tags.split_whitespace().map(str::to_string).collect());
    let delay = Duration::from_nanos(params.update_delay_nsec.unwrap_or(0));
    let catalog = state.catalog.clone();
    let record = blocking(move || {
        catalog.rate_and_tag(params.song_id, params.rating, tags.as_deref(), delay)
    })
    .await?;
    Ok(Json(record.to_song(Vec::new())))
}

pub async fn tags(State(state): State<AppState>) -> JsonResult<Vec<String>> {
    let catalog = state.catalog.clone();
    let tags = blocking(move || catalog.tags()).await?;
    Ok(Json(tags))
}

pub async fn query(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> JsonResult<Vec<Song>> {
    let query = build_query(params)?;
    let catalog = state.catalog.clone();
    let records = blocking(move || catalog.query(&query)).await?;
    Ok(Json(
        records
            .iter()
            .map(|record| record.to_song(Vec::new()))
            .collect(),
    ))
}

fn build_query(
    params: QueryParams,
) -> Result<SongQuery, (StatusCode, Json<crate::state::ErrorResponse>)> {
    let mut query = SongQuery {
        artist: params.artist.unwrap_or_default(),
        title: params.title.unwrap_or_default(),
        album: params.album.unwrap_or_default(),
        album_id: params.album_id.unwrap_or_default(),
        keywords: params
            .keywords
            .as_deref()
            .unwrap_or("")
            .split_whitespace()
            .map(str::to_string)
            .collect(),
        min_rating: params.min_rating,
        unrated: params.min_rating.is_none() && flag(&params.unrated),
        max_plays: params.max_plays,
        track: params.track.unwrap_or(0),
        disc: params.disc.unwrap_or(0),
        max_disc: params.max_disc,
        shuffle: flag(&params.shuffle),
        ..SongQuery::default()
    };
    if flag(&params.first_track) {
        query.track = 1;
        query.disc = 1;
    }
    if let Some(value) = params.min_first_played.as_deref() {
        query.min_first_played = Some(parse_time("minFirstPlayed", value)?);
    }
    if let Some(value) = params.max_last_played.as_deref() {
        query.max_last_played = Some(parse_time("maxLastPlayed", value)?);
    }
    for tag in params.tags.as_deref().unwrap_or("").split_whitespace() {
        match tag.strip_prefix('-') {
            Some(negated) if !negated.is_empty() => query.not_tags.push(negated.to_lowercase()),
            Some(_) => {}
            None => query.tags.push(tag.to_lowercase()),
        }
    }
    Ok(query)
}

fn parse_time(
    name: &str,
    value: &str,
) -> Result<OffsetDateTime, (StatusCode, Json<crate::state::ErrorResponse>)> {
    OffsetDateTime::parse(value.trim(), &Rfc3339)
        .map_err(|err| json_error(StatusCode::BAD_REQUEST, format!("bad {}: {}", name, err)))
}
