use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::{keywords, normalize, Play, Song};
use redb::{
    CommitError, Database, DatabaseError, MultimapTableDefinition, ReadTransaction,
    ReadableMultimapTable, ReadableTable, StorageError, TableDefinition, TableError,
    TransactionError,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub(crate) const SONGS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("songs");
pub(crate) const PLAYS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("plays");
pub(crate) const DELETED_SONGS_TABLE: TableDefinition<u64, &[u8]> =
    TableDefinition::new("deleted_songs");
pub(crate) const DELETED_PLAYS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("deleted_plays");
pub(crate) const SHA1_INDEX: MultimapTableDefinition<&str, u64> =
    MultimapTableDefinition::new("sha1_index");
pub(crate) const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub(crate) const NEXT_SONG_ID_KEY: &str = "next_song_id";
const KEY_SEP: char = '\x1f';

/// Stored form of a song. Plays live in their own table keyed under the song ID.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SongRecord {
    pub id: u64,
    pub sha1: String,
    pub filename: String,
    pub cover_filename: String,
    pub artist: String,
    pub title: String,
    pub album: String,
    pub album_artist: String,
    pub album_id: String,
    pub track: u32,
    pub disc: u32,
    pub length: f64,
    pub track_gain: f64,
    pub album_gain: f64,
    pub peak_amp: f64,
    pub rating: f64,
    pub tags: Vec<String>,
    pub artist_lower: String,
    pub title_lower: String,
    pub album_lower: String,
    pub keywords: Vec<String>,
    pub num_plays: u32,
    pub first_start_time: Option<OffsetDateTime>,
    pub last_start_time: Option<OffsetDateTime>,
    pub last_modified: OffsetDateTime,
}

impl SongRecord {
    pub fn new(id: u64, song: &Song, now: OffsetDateTime) -> Self {
        let mut record = Self {
            id,
            sha1: String::new(),
            filename: String::new(),
            cover_filename: String::new(),
            artist: String::new(),
            title: String::new(),
            album: String::new(),
            album_artist: String::new(),
            album_id: String::new(),
            track: 0,
            disc: 0,
            length: 0.0,
            track_gain: 0.0,
            album_gain: 0.0,
            peak_amp: 0.0,
            rating: common::UNRATED,
            tags: Vec::new(),
            artist_lower: String::new(),
            title_lower: String::new(),
            album_lower: String::new(),
            keywords: Vec::new(),
            num_plays: 0,
            first_start_time: None,
            last_start_time: None,
            last_modified: now,
        };
        record.set_metadata(song);
        record
    }

    /// Overwrites everything read from the file and rebuilds the derived search fields.
    pub fn set_metadata(&mut self, song: &Song) {
        self.sha1 = song.sha1.clone();
        self.filename = song.filename.clone();
        self.cover_filename = song.cover_filename.clone();
        self.artist = song.artist.clone();
        self.title = song.title.clone();
        self.album = song.album.clone();
        self.album_artist = song.album_artist.clone();
        self.album_id = song.album_id.clone();
        self.track = song.track;
        self.disc = song.disc;
        self.length = song.length;
        self.track_gain = song.track_gain;
        self.album_gain = song.album_gain;
        self.peak_amp = song.peak_amp;
        self.reindex();
    }

    /// Recomputes normalized text and keywords. Returns true if anything changed.
    pub fn reindex(&mut self) -> bool {
        let artist_lower = normalize(&self.artist);
        let title_lower = normalize(&self.title);
        let album_lower = normalize(&self.album);
        let words = keywords([
            self.artist.as_str(),
            self.title.as_str(),
            self.album.as_str(),
            self.album_artist.as_str(),
        ]);
        let tags = common::clean_tags(&self.tags);
        let changed = artist_lower != self.artist_lower
            || title_lower != self.title_lower
            || album_lower != self.album_lower
            || words != self.keywords
            || tags != self.tags;
        self.artist_lower = artist_lower;
        self.title_lower = title_lower;
        self.album_lower = album_lower;
        self.keywords = words;
        self.tags = tags;
        changed
    }

    pub fn set_rating(&mut self, rating: f64) {
        self.rating = if rating < 0.0 {
            common::UNRATED
        } else {
            rating.min(1.0)
        };
    }

    pub fn record_play(&mut self, start_time: OffsetDateTime) {
        self.num_plays += 1;
        if self.first_start_time.map_or(true, |first| start_time < first) {
            self.first_start_time = Some(start_time);
        }
        if self.last_start_time.map_or(true, |last| start_time > last) {
            self.last_start_time = Some(start_time);
        }
    }

    pub fn rebuild_play_stats(&mut self, plays: &[Play]) {
        self.num_plays = 0;
        self.first_start_time = None;
        self.last_start_time = None;
        for play in plays {
            self.record_play(play.start_time);
        }
    }

    pub fn to_song(&self, plays: Vec<Play>) -> Song {
        Song {
            sha1: self.sha1.clone(),
            song_id: self.id.to_string(),
            filename: self.filename.clone(),
            cover_filename: self.cover_filename.clone(),
            artist: self.artist.clone(),
            title: self.title.clone(),
            album: self.album.clone(),
            album_artist: self.album_artist.clone(),
            album_id: self.album_id.clone(),
            track: self.track,
            disc: self.disc,
            length: self.length,
            track_gain: self.track_gain,
            album_gain: self.album_gain,
            peak_amp: self.peak_amp,
            rating: self.rating,
            plays,
            tags: self.tags.clone(),
            ..Song::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Live,
    Deleted,
}

impl Kind {
    pub(crate) fn songs(self) -> TableDefinition<'static, u64, &'static [u8]> {
        match self {
            Kind::Live => SONGS_TABLE,
            Kind::Deleted => DELETED_SONGS_TABLE,
        }
    }

    pub(crate) fn plays(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            Kind::Live => PLAYS_TABLE,
            Kind::Deleted => DELETED_PLAYS_TABLE,
        }
    }
}

#[derive(Clone)]
pub struct SongStore {
    pub(crate) db: Arc<Database>,
}

impl SongStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn init_tables(&self) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let _ = write_txn.open_table(SONGS_TABLE)?;
            let _ = write_txn.open_table(PLAYS_TABLE)?;
            let _ = write_txn.open_table(DELETED_SONGS_TABLE)?;
            let _ = write_txn.open_table(DELETED_PLAYS_TABLE)?;
            let _ = write_txn.open_multimap_table(SHA1_INDEX)?;
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get(&self, kind: Kind, id: u64) -> Result<Option<SongRecord>, StoreError> {
        let read_txn = self.db.begin_read()?;
        read_record(&read_txn, kind, id)
    }

    /// IDs of live songs with the given content hash.
    pub fn ids_for_sha1(&self, sha1: &str) -> Result<Vec<u64>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let index = match read_txn.open_multimap_table(SHA1_INDEX) {
            Ok(index) => index,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut ids = Vec::new();
        for id in index.get(sha1)? {
            ids.push(id?.value());
        }
        Ok(ids)
    }

    pub fn plays(&self, kind: Kind, id: u64, max: usize) -> Result<Vec<Play>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(kind.plays()) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let (start, end) = play_range(id);
        let mut plays = Vec::new();
        for entry in table.range(start.as_str()..end.as_str())? {
            if plays.len() >= max {
                break;
            }
            let entry = entry?;
            plays.push(decode_value(entry.1.value())?);
        }
        Ok(plays)
    }

    /// Records in ID order after `after`, keeping those that pass `filter`.
    /// Returns the page and the last ID examined when more records may follow.
    pub fn scan_songs<F>(
        &self,
        kind: Kind,
        after: Option<u64>,
        max: usize,
        mut filter: F,
    ) -> Result<(Vec<SongRecord>, Option<u64>), StoreError>
    where
        F: FnMut(&SongRecord) -> bool,
    {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(kind.songs()) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok((Vec::new(), None)),
            Err(err) => return Err(err.into()),
        };
        let start = match after {
            Some(id) => match id.checked_add(1) {
                Some(next) => next,
                None => return Ok((Vec::new(), None)),
            },
            None => 0,
        };
        let mut out = Vec::new();
        let mut last = None;
        for entry in table.range(start..)? {
            if out.len() >= max {
                return Ok((out, last));
            }
            let entry = entry?;
            let record: SongRecord = decode_value(entry.1.value())?;
            last = Some(record.id);
            if filter(&record) {
                out.push(record);
            }
        }
        Ok((out, None))
    }

    /// Plays in key order after the `after` key. Returns the page and the last key when more may follow.
    pub fn scan_plays(
        &self,
        after: Option<&str>,
        max: usize,
    ) -> Result<(Vec<(u64, Play)>, Option<String>), StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(PLAYS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok((Vec::new(), None)),
            Err(err) => return Err(err.into()),
        };
        let mut out = Vec::new();
        let mut last: Option<String> = None;
        let iter = match after {
            Some(after) => table.range::<&str>((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))?,
            None => table.range::<&str>(..)?,
        };
        for entry in iter {
            if out.len() >= max {
                return Ok((out, last));
            }
            let entry = entry?;
            let key = entry.0.value().to_string();
            let id = song_id_from_play_key(&key)?;
            out.push((id, decode_value(entry.1.value())?));
            last = Some(key);
        }
        Ok((out, None))
    }
}

pub(crate) fn read_record(
    txn: &ReadTransaction,
    kind: Kind,
    id: u64,
) -> Result<Option<SongRecord>, StoreError> {
    let table = match txn.open_table(kind.songs()) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let record = match table.get(id)? {
        Some(value) => Some(decode_value(value.value())?),
        None => None,
    };
    Ok(record)
}

pub(crate) fn play_key(id: u64, seq: u64) -> String {
    format!("{:020}{}{:010}", id, KEY_SEP, seq)
}

pub(crate) fn play_range(id: u64) -> (String, String) {
    (
        format!("{:020}{}", id, KEY_SEP),
        format!("{:020}{}{}", id, KEY_SEP, '\u{10ffff}'),
    )
}

pub(crate) fn play_seq(key: &str) -> Option<u64> {
    key.rsplit(KEY_SEP).next()?.parse().ok()
}

fn song_id_from_play_key(key: &str) -> Result<u64, StoreError> {
    key.split(KEY_SEP)
        .next()
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| StoreError::Cursor(format!("bad play key {:?}", key)))
}

pub fn open_or_create_db(path: &Path) -> Result<Database, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Redb(redb::Error),
    Database(DatabaseError),
    Table(TableError),
    Transaction(TransactionError),
    Storage(StorageError),
    Commit(CommitError),
    Bincode(Box<bincode::ErrorKind>),
    Integrity { sha1: String, count: usize },
    NotFound(u64),
    Cursor(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<redb::Error> for StoreError {
    fn from(err: redb::Error) -> Self {
        StoreError::Redb(err)
    }
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        StoreError::Database(err)
    }
}

impl From<TableError> for StoreError {
    fn from(err: TableError) -> Self {
        StoreError::Table(err)
    }
}

impl From<TransactionError> for StoreError {
    fn from(err: TransactionError) -> Self {
        StoreError::Transaction(err)
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        StoreError::Storage(err)
    }
}

impl From<CommitError> for StoreError {
    fn from(err: CommitError) -> Self {
        StoreError::Commit(err)
    }
}

impl From<Box<bincode::ErrorKind>> for StoreError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        StoreError::Bincode(err)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(err) => write!(f, "io error: {}", err),
            StoreError::Redb(err) => write!(f, "redb error: {}", err),
            StoreError::Database(err) => write!(f, "redb database error: {}", err),
            StoreError::Table(err) => write!(f, "redb table error: {}", err),
            StoreError::Transaction(err) => write!(f, "redb transaction error: {}", err),
            StoreError::Storage(err) => write!(f, "redb storage error: {}", err),
            StoreError::Commit(err) => write!(f, "redb commit error: {}", err),
            StoreError::Bincode(err) => write!(f, "bincode error: {}", err),
            StoreError::Integrity { sha1, count } => write!(
                f,
                "found {} songs with SHA1 {}; expected 0 or 1",
                count, sha1
            ),
            StoreError::NotFound(id) => write!(f, "song {} not found", id),
            StoreError::Cursor(message) => write!(f, "bad cursor: {}", message),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(err) => Some(err),
            StoreError::Redb(err) => Some(err),
            StoreError::Database(err) => Some(err),
            StoreError::Table(err) => Some(err),
            StoreError::Transaction(err) => Some(err),
            StoreError::Storage(err) => Some(err),
            StoreError::Commit(err) => Some(err),
            StoreError::Bincode(err) => Some(err),
            _ => None,
        }
    }
}

pub(crate) fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use time::macros::datetime;

    pub fn temp_store() -> (tempfile::TempDir, SongStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = open_or_create_db(&dir.path().join("catalog.redb")).unwrap();
        let store = SongStore::new(Arc::new(db));
        store.init_tables().unwrap();
        (dir, store)
    }

    #[test]
    fn record_derives_search_fields() {
        let song = Song {
            sha1: "abc".into(),
            artist: "Björk".into(),
            title: "Jóga".into(),
            album: "Homogenic".into(),
            album_artist: "Various Artists".into(),
            ..Song::default()
        };
        let record = SongRecord::new(1, &song, datetime!(2024-01-01 0:00 UTC));
        assert_eq!(record.artist_lower, "bjork");
        assert_eq!(record.title_lower, "joga");
        assert_eq!(
            record.keywords,
            vec!["artists", "bjork", "homogenic", "joga", "various"]
        );
        assert_eq!(record.rating, common::UNRATED);
    }

    #[test]
    fn play_stats_track_bounds() {
        let mut record = SongRecord::new(1, &Song::default(), OffsetDateTime::now_utc());
        let plays = vec![
            Play::new(datetime!(2020-05-01 0:00 UTC), "a"),
            Play::new(datetime!(2019-01-01 0:00 UTC), "b"),
            Play::new(datetime!(2021-01-01 0:00 UTC), "c"),
        ];
        record.rebuild_play_stats(&plays);
        assert_eq!(record.num_plays, 3);
        assert_eq!(record.first_start_time, Some(datetime!(2019-01-01 0:00 UTC)));
        assert_eq!(record.last_start_time, Some(datetime!(2021-01-01 0:00 UTC)));
    }

    #[test]
    fn rating_is_clamped() {
        let mut record = SongRecord::new(1, &Song::default(), OffsetDateTime::now_utc());
        record.set_rating(1.5);
        assert_eq!(record.rating, 1.0);
        record.set_rating(-0.2);
        assert_eq!(record.rating, common::UNRATED);
    }

    #[test]
    fn play_keys_sort_by_song_then_sequence() {
        let (start, end) = play_range(7);
        let key = play_key(7, 12);
        assert!(start < key && key < end);
        assert!(play_key(7, 9) < play_key(7, 10));
        assert!(play_key(7, 99) < play_key(8, 0));
        assert_eq!(play_seq(&key), Some(12));
        assert_eq!(song_id_from_play_key(&key).unwrap(), 7);
    }

    #[test]
    fn empty_store_reads_nothing() {
        let (_dir, store) = temp_store();
        assert!(store.get(Kind::Live, 1).unwrap().is_none());
        assert!(store.ids_for_sha1("abc").unwrap().is_empty());
        let (page, more) = store.scan_songs(Kind::Live, None, 10, |_| true).unwrap();
        assert!(page.is_empty() && more.is_none());
    }
}
