use std::collections::HashMap;
use std::time::Duration;

use common::{clean_tags, unix_nanos, PlayDump, ReindexPage, Song, UNRATED};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info};

#[derive(Debug)]
pub enum ClientError {
    Http(reqwest::Error),
    Status { status: u16, body: String },
    Json(serde_json::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Http(err) => write!(f, "http error: {}", err),
            ClientError::Status { status, body } => {
                write!(f, "server returned {}: {}", status, body.trim())
            }
            ClientError::Json(err) => write!(f, "json error: {}", err),
            ClientError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Http(err)
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Json(err)
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportKind {
    Songs,
    Plays,
}

impl ExportKind {
    fn as_param(self) -> &'static str {
        match self {
            ExportKind::Songs => "song",
            ExportKind::Plays => "play",
        }
    }
}

/// Options for a paginated export pull.
#[derive(Clone, Debug, Default)]
pub struct ExportOptions {
    pub deleted: bool,
    pub min_last_modified: Option<OffsetDateTime>,
    pub max: Option<usize>,
    pub omit: Vec<String>,
}

#[derive(Clone)]
pub struct CatalogClient {
    http: Client,
    server_url: String,
    batch_size: usize,
}

impl CatalogClient {
    pub fn new(server_url: &str, batch_size: usize) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.trim_end_matches('/').to_string(),
            batch_size: batch_size.max(1),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.server_url, path)
    }

    /// Sends songs in batches. Without `replace`, user data is left to the server.
    pub async fn push_songs(
        &self,
        songs: &[Song],
        replace: bool,
        delay: Option<Duration>,
    ) -> Result<usize, ClientError> {
        let mut pushed = 0;
        for batch in songs.chunks(self.batch_size) {
            let body = encode_ndjson(batch, replace)?;
            let mut query: Vec<(&str, String)> = Vec::new();
            if replace {
                query.push(("replaceUserData", "1".to_string()));
            }
            if let Some(delay) = delay {
                query.push(("updateDelayNsec", delay.as_nanos().to_string()));
            }
            let response = self
                .http
                .post(self.url("import"))
                .query(&query)
                .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                .body(body)
                .send()
                .await?;
            check(response).await?;
            pushed += batch.len();
            info!("Pushed {} of {} song(s)", pushed, songs.len());
        }
        Ok(pushed)
    }

    pub async fn export_songs(&self, options: &ExportOptions) -> Result<Vec<Song>, ClientError> {
        self.export(ExportKind::Songs, options).await
    }

    pub async fn export_plays(&self) -> Result<Vec<PlayDump>, ClientError> {
        self.export(ExportKind::Plays, &ExportOptions::default())
            .await
    }

    /// Follows continuation cursors until a page arrives without one.
    pub async fn export<T: DeserializeOwned>(
        &self,
        kind: ExportKind,
        options: &ExportOptions,
    ) -> Result<Vec<T>, ClientError> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut query: Vec<(&str, String)> = vec![("type", kind.as_param().to_string())];
            if let Some(cursor) = &cursor {
                query.push(("cursor", cursor.clone()));
            }
            if options.deleted {
                query.push(("deleted", "1".to_string()));
            }
            if let Some(min) = options.min_last_modified {
                query.push(("minLastModifiedNsec", unix_nanos(min).to_string()));
            }
            if let Some(max) = options.max {
                query.push(("max", max.to_string()));
            }
            if !options.omit.is_empty() {
                query.push(("omit", options.omit.join(",")));
            }

            let response = self.http.get(self.url("export")).query(&query).send().await?;
            let body = check(response).await?;
            let (items, next) = parse_page::<T>(&body)?;
            debug!("Export page with {} item(s)", items.len());
            out.extend(items);
            match next {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(out),
            }
        }
    }

    pub async fn dump_song(&self, song_id: &str) -> Result<Song, ClientError> {
        let response = self
            .http
            .get(self.url("dump_song"))
            .query(&[("songId", song_id)])
            .send()
            .await?;
        let body = check(response).await?;
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn delete_song(&self, song_id: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url("delete_song"))
            .query(&[("songId", song_id)])
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    pub async fn rate_and_tag(
        &self,
        song_id: &str,
        rating: Option<f64>,
        tags: Option<&[String]>,
    ) -> Result<(), ClientError> {
        let mut query: Vec<(&str, String)> = vec![("songId", song_id.to_string())];
        if let Some(rating) = rating {
            query.push(("rating", rating.to_string()));
        }
        if let Some(tags) = tags {
            query.push(("tags", tags.join(" ")));
        }
        let response = self
            .http
            .post(self.url("rate_and_tag"))
            .query(&query)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    pub async fn report_play(
        &self,
        song_id: &str,
        start_time: OffsetDateTime,
    ) -> Result<(), ClientError> {
        let start = start_time
            .format(&Rfc3339)
            .map_err(|err| ClientError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, err)))?;
        let response = self
            .http
            .post(self.url("played"))
            .query(&[("songId", song_id), ("startTime", start.as_str())])
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Runs reindex steps until the server stops returning a cursor.
    pub async fn reindex(&self) -> Result<ReindexPage, ClientError> {
        let mut total = ReindexPage::default();
        let mut cursor = String::new();
        loop {
            let response = self
                .http
                .post(self.url("reindex"))
                .query(&[("cursor", cursor.as_str())])
                .send()
                .await?;
            let page: ReindexPage = serde_json::from_str(&check(response).await?)?;
            total.scanned += page.scanned;
            total.updated += page.updated;
            info!(
                "Reindexed {} song(s), updated {}",
                total.scanned, total.updated
            );
            if page.cursor.is_empty() {
                return Ok(total);
            }
            cursor = page.cursor;
        }
    }

    /// Folds the source song's user data into the destination.
    pub async fn merge_songs(
        &self,
        src_id: &str,
        dst_id: &str,
        delete_src: bool,
    ) -> Result<Song, ClientError> {
        let src = self.dump_song(src_id).await?;
        let mut dst = self.dump_song(dst_id).await?;
        merge_user_data(&mut dst, &src);
        self.push_songs(std::slice::from_ref(&dst), true, None).await?;
        if delete_src {
            self.delete_song(src_id).await?;
        }
        Ok(dst)
    }

    pub async fn server_time(&self) -> Result<i128, ClientError> {
        let response = self.http.get(self.url("now")).send().await?;
        let body = check(response).await?;
        body.trim().parse::<i128>().map_err(|err| ClientError::Status {
            status: 200,
            body: format!("bad time {:?}: {}", body, err),
        })
    }
}

async fn check(response: Response) -> Result<String, ClientError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ClientError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

/// Encodes one JSON object per line. Without `replace`, user data is dropped.
pub fn encode_ndjson(songs: &[Song], replace: bool) -> Result<String, ClientError> {
    let mut out = String::new();
    for song in songs {
        let line = if replace {
            serde_json::to_string(song)?
        } else {
            let stripped = Song {
                rating: UNRATED,
                plays: Vec::new(),
                tags: Vec::new(),
                ..song.clone()
            };
            serde_json::to_string(&stripped)?
        };
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

/// Splits an export page into its items and the trailing cursor, if any.
pub fn parse_page<T: DeserializeOwned>(body: &str) -> Result<(Vec<T>, Option<String>), ClientError> {
    let mut items = Vec::new();
    let mut cursor = None;
    for value in serde_json::Deserializer::from_str(body).into_iter::<Value>() {
        match value? {
            Value::String(next) => cursor = Some(next),
            value => items.push(serde_json::from_value(value)?),
        }
    }
    Ok((items, cursor))
}

pub fn merge_user_data(dst: &mut Song, src: &Song) {
    dst.rating = dst.rating.max(src.rating);
    dst.tags = clean_tags(dst.tags.iter().chain(src.tags.iter()));
    dst.plays.extend(src.plays.iter().cloned());
    dst.plays.sort();
    dst.plays.dedup();
}

/// Drops songs whose metadata already matches the dump record with the same SHA1.
pub fn filter_unchanged(songs: Vec<Song>, dump: &[Song]) -> Vec<Song> {
    let by_sha1: HashMap<&str, &Song> = dump.iter().map(|s| (s.sha1.as_str(), s)).collect();
    songs
        .into_iter()
        .filter(|song| match by_sha1.get(song.sha1.as_str()) {
            Some(old) => !song.metadata_equals(old),
            None => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Play;
    use time::macros::datetime;

    fn song(sha1: &str, title: &str) -> Song {
        Song {
            sha1: sha1.into(),
            filename: format!("{}.mp3", title),
            artist: "Artist".into(),
            title: title.into(),
            album: "Album".into(),
            ..Song::default()
        }
    }

    #[test]
    fn page_yields_items_then_cursor() {
        let body = "{\"songId\":\"1\",\"artist\":\"A\",\"title\":\"T\",\"album\":\"B\",\"rating\":0.5}\n\
                    {\"songId\":\"2\",\"artist\":\"A\",\"title\":\"U\",\"album\":\"B\"}\n\
                    \"2\"\n";
        let (songs, cursor) = parse_page::<Song>(body).unwrap();
        assert_eq!(songs.len(), 2);
        assert_eq!(songs[1].song_id, "2");
        assert!(!songs[1].is_rated());
        assert_eq!(cursor.as_deref(), Some("2"));
    }

    #[test]
    fn page_without_cursor_is_last() {
        let body = "{\"songId\":\"7\",\"play\":{\"t\":\"2020-01-01T00:00:00Z\",\"ip\":\"::1\"}}\n";
        let (plays, cursor) = parse_page::<PlayDump>(body).unwrap();
        assert_eq!(plays[0].play.start_time, datetime!(2020-01-01 0:00 UTC));
        assert!(cursor.is_none());

        let (empty, cursor) = parse_page::<PlayDump>("").unwrap();
        assert!(empty.is_empty() && cursor.is_none());
    }

    #[test]
    fn non_replacing_push_drops_user_data() {
        let mut rated = song("aa", "One");
        rated.rating = 0.75;
        rated.tags = vec!["rock".into()];
        rated.plays = vec![Play::new(datetime!(2021-01-01 0:00 UTC), "10.0.0.1")];

        let body = encode_ndjson(std::slice::from_ref(&rated), false).unwrap();
        let sent: Song = serde_json::from_str(body.trim()).unwrap();
        assert!(!sent.is_rated());
        assert!(sent.tags.is_empty() && sent.plays.is_empty());

        let body = encode_ndjson(&[rated.clone(), song("bb", "Two")], true).unwrap();
        assert_eq!(body.lines().count(), 2);
        let sent: Song = serde_json::from_str(body.lines().next().unwrap()).unwrap();
        assert_eq!(sent.rating, 0.75);
        assert_eq!(sent.plays.len(), 1);
    }

    #[test]
    fn merged_user_data_is_a_union() {
        let shared = Play::new(datetime!(2022-02-02 2:00 UTC), "10.0.0.1");
        let mut dst = song("aa", "One");
        dst.rating = 0.25;
        dst.tags = vec!["rock".into()];
        dst.plays = vec![shared.clone()];
        let mut src = song("bb", "One");
        src.rating = 0.5;
        src.tags = vec!["Live".into(), "rock".into()];
        src.plays = vec![
            Play::new(datetime!(2021-01-01 0:00 UTC), "10.0.0.2"),
            shared.clone(),
        ];

        merge_user_data(&mut dst, &src);
        assert_eq!(dst.rating, 0.5);
        assert_eq!(dst.tags, vec!["live", "rock"]);
        assert_eq!(dst.plays.len(), 2);
        assert_eq!(dst.plays[1], shared);
    }

    #[test]
    fn unchanged_songs_are_not_pushed() {
        let dump = vec![song("aa", "One"), song("bb", "Two")];
        let mut retitled = song("bb", "Two");
        retitled.title = "Two (Remastered)".into();
        let songs = vec![song("aa", "One"), retitled, song("cc", "Three")];
        let pending = filter_unchanged(songs, &dump);
        let sha1s: Vec<&str> = pending.iter().map(|s| s.sha1.as_str()).collect();
        assert_eq!(sha1s, vec!["bb", "cc"]);
    }
}
