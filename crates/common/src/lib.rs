use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Rating value for songs that have never been rated.
pub const UNRATED: f64 = -1.0;

/// Album name used by taggers for standalone recordings.
pub const NON_ALBUM_TRACKS: &str = "[non-album tracks]";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Play {
    #[serde(rename = "t", with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(rename = "ip", default)]
    pub ip_address: String,
}

impl Play {
    pub fn new(start_time: OffsetDateTime, ip_address: impl Into<String>) -> Self {
        Self {
            start_time,
            ip_address: ip_address.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayDump {
    pub song_id: String,
    pub play: Play,
}

/// One step of a reindex pass. An empty cursor means the pass is complete.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexPage {
    pub scanned: usize,
    pub updated: usize,
    #[serde(default)]
    pub cursor: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GainInfo {
    pub track_gain: f64,
    pub album_gain: f64,
    pub peak_amp: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sha1: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub song_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filename: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cover_filename: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub album: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub album_artist: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub album_id: String,
    #[serde(skip)]
    pub cover_id: String,
    #[serde(skip)]
    pub recording_id: String,
    #[serde(default)]
    pub track: u32,
    #[serde(default)]
    pub disc: u32,
    /// Duration in seconds.
    #[serde(default)]
    pub length: f64,
    #[serde(default)]
    pub track_gain: f64,
    #[serde(default)]
    pub album_gain: f64,
    #[serde(default)]
    pub peak_amp: f64,
    #[serde(default = "unrated")]
    pub rating: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plays: Vec<Play>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn unrated() -> f64 {
    UNRATED
}

impl Default for Song {
    fn default() -> Self {
        Self {
            sha1: String::new(),
            song_id: String::new(),
            filename: String::new(),
            cover_filename: String::new(),
            artist: String::new(),
            title: String::new(),
            album: String::new(),
            album_artist: String::new(),
            album_id: String::new(),
            cover_id: String::new(),
            recording_id: String::new(),
            track: 0,
            disc: 0,
            length: 0.0,
            track_gain: 0.0,
            album_gain: 0.0,
            peak_amp: 0.0,
            rating: UNRATED,
            plays: Vec::new(),
            tags: Vec::new(),
        }
    }
}

impl Song {
    pub fn apply_gains(&mut self, gains: &GainInfo) {
        self.track_gain = gains.track_gain;
        self.album_gain = gains.album_gain;
        self.peak_amp = gains.peak_amp;
    }

    /// Sorts and dedupes tags and plays.
    pub fn clean(&mut self) {
        self.tags = clean_tags(std::mem::take(&mut self.tags));
        self.plays.sort();
        self.plays.dedup();
    }

    /// Compares everything read from the file itself, ignoring user data and IDs.
    pub fn metadata_equals(&self, other: &Song) -> bool {
        self.sha1 == other.sha1
            && self.filename == other.filename
            && self.cover_filename == other.cover_filename
            && self.artist == other.artist
            && self.title == other.title
            && self.album == other.album
            && self.album_artist == other.album_artist
            && self.album_id == other.album_id
            && self.track == other.track
            && self.disc == other.disc
            && self.length == other.length
            && self.track_gain == other.track_gain
            && self.album_gain == other.album_gain
            && self.peak_amp == other.peak_amp
    }

    pub fn is_rated(&self) -> bool {
        self.rating >= 0.0
    }
}

/// Lowercases tags, drops empty ones and returns them sorted without duplicates.
pub fn clean_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let set: BTreeSet<String> = tags
        .into_iter()
        .map(|tag| tag.as_ref().trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect();
    set.into_iter().collect()
}

/// Decomposes `input`, strips combining marks and lowercases the rest.
pub fn normalize(input: &str) -> String {
    input
        .nfkd()
        .filter(|ch| !is_combining_mark(*ch))
        .collect::<String>()
        .to_lowercase()
}

pub fn keywords<'a, I>(fields: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut words = BTreeSet::new();
    for field in fields {
        let normalized = normalize(field);
        for word in normalized.split(|ch: char| !ch.is_alphanumeric()) {
            if !word.is_empty() {
                words.insert(word.to_string());
            }
        }
    }
    words.into_iter().collect()
}

pub fn unix_nanos(time: OffsetDateTime) -> i128 {
    time.unix_timestamp_nanos()
}

pub fn relpath_from(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(path_to_slash_string(rel))
}

pub fn join_relpath(root: &Path, relpath: &str) -> PathBuf {
    let mut out = PathBuf::from(root);
    for part in relpath.split('/').filter(|part| !part.is_empty()) {
        out.push(part);
    }
    out
}

fn path_to_slash_string(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn normalize_strips_diacritics() {
        assert_eq!(normalize("Björk Guðmundsdóttir"), "bjork guðmundsdottir");
        assert_eq!(normalize("ÉCOLE"), "ecole");
    }

    #[test]
    fn keywords_are_sorted_and_unique() {
        let words = keywords(["Sigur Rós", "Ágætis byrjun", "sigur-ros"]);
        assert_eq!(words, vec!["agætis", "byrjun", "ros", "sigur"]);
    }

    #[test]
    fn clean_sorts_tags_and_plays() {
        let first = Play::new(datetime!(2020-01-01 0:00 UTC), "10.0.0.1");
        let second = Play::new(datetime!(2021-06-01 12:30 UTC), "10.0.0.2");
        let mut song = Song {
            tags: vec!["rock".into(), "Electronic".into(), "rock".into(), " ".into()],
            plays: vec![second.clone(), first.clone(), second.clone()],
            ..Song::default()
        };
        song.clean();
        assert_eq!(song.tags, vec!["electronic", "rock"]);
        assert_eq!(song.plays, vec![first, second]);
    }

    #[test]
    fn play_uses_short_json_names() {
        let play = Play::new(datetime!(2019-03-04 05:06:07 UTC), "127.0.0.1");
        let json = serde_json::to_string(&play).unwrap();
        assert_eq!(json, r#"{"t":"2019-03-04T05:06:07Z","ip":"127.0.0.1"}"#);
        let decoded: Play = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, play);
    }

    #[test]
    fn missing_rating_means_unrated() {
        let song: Song =
            serde_json::from_str(r#"{"sha1":"abc","artist":"A","title":"T","album":"B"}"#)
                .unwrap();
        assert!(!song.is_rated());
        assert!(song.tags.is_empty());
        let json = serde_json::to_string(&song).unwrap();
        assert!(!json.contains("songId"));
        assert!(!json.contains("plays"));
    }

    #[test]
    fn metadata_equals_ignores_user_data() {
        let base = Song {
            sha1: "1234".into(),
            artist: "Artist".into(),
            title: "Title".into(),
            ..Song::default()
        };
        let mut other = base.clone();
        other.rating = 0.5;
        other.tags = vec!["mellow".into()];
        other.song_id = "7".into();
        assert!(base.metadata_equals(&other));
        other.title = "Other".into();
        assert!(!base.metadata_equals(&other));
    }

    #[test]
    fn join_relpath_skips_empty_parts() {
        let path = join_relpath(Path::new("/music"), "a//b/c.mp3");
        assert_eq!(path, PathBuf::from("/music/a/b/c.mp3"));
        assert_eq!(relpath_from(Path::new("/music"), &path).as_deref(), Some("a/b/c.mp3"));
    }
}
