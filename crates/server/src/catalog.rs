use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::{Play, Song};
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheError, CacheKey, CacheTier, MemoryTier, RedbTier, UpdateTypes};
use crate::config::ServerConfig;
use crate::query::{finalize_ids, sort_records, CachedQuery, SongQuery};
use crate::store::{Kind, SongRecord, SongStore, StoreError};

const SCAN_PAGE: usize = 1000;

/// Merge engine plus cache, the unit every request handler talks to.
#[derive(Clone)]
pub struct Catalog {
    pub(crate) store: SongStore,
    pub(crate) cache: Cache,
    pub(crate) config: Arc<ServerConfig>,
}

impl Catalog {
    pub fn new(store: SongStore, cache: Cache, config: Arc<ServerConfig>) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    /// Builds the cache tiers the config asks for: memory always, redb when persistent.
    pub fn with_tiers(
        store: SongStore,
        persistent: Option<Arc<redb::Database>>,
        config: Arc<ServerConfig>,
    ) -> Result<Self, CacheError> {
        let mut tiers: Vec<Arc<dyn CacheTier>> = vec![Arc::new(MemoryTier::new())];
        if let Some(db) = persistent {
            tiers.push(Arc::new(RedbTier::new(db)?));
        }
        Ok(Self::new(store, Cache::new(tiers), config))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Merges one incoming song. The cached copy of an existing song is evicted
    /// before the write transaction starts.
    pub fn import_song(
        &self,
        song: &Song,
        replace_user_data: bool,
        delay: Duration,
    ) -> Result<SongRecord, StoreError> {
        let ids = self.store.ids_for_sha1(&song.sha1)?;
        if ids.len() > 1 {
            return Err(StoreError::Integrity {
                sha1: song.sha1.clone(),
                count: ids.len(),
            });
        }
        if let Some(&id) = ids.first() {
            self.cache.evict(&CacheKey::Song(id));
        }
        let mut expected = UpdateTypes::METADATA;
        if replace_user_data {
            expected |= UpdateTypes::RATING | UpdateTypes::TAGS | UpdateTypes::PLAYS;
        }
        self.cache.flush_for_update(expected);

        let merged = self.store.upsert(song, replace_user_data, delay)?;
        debug!(
            "{} song {} from {:?}",
            if merged.inserted { "Inserted" } else { "Updated" },
            merged.record.id,
            merged.record.filename
        );
        self.cache
            .write_after(&CacheKey::Song(merged.record.id), &merged.record);
        self.cache.flush_for_update(merged.updates);
        Ok(merged.record)
    }

    /// Merges decoded songs in order, stopping at the first failure. Songs
    /// merged before a failure stay merged.
    pub fn import<I>(&self, songs: I, replace_user_data: bool, delay: Duration) -> Result<usize, ImportError>
    where
        I: IntoIterator<Item = Result<Song, serde_json::Error>>,
    {
        let mut count = 0;
        for song in songs {
            let song = song.map_err(|source| ImportError::Decode {
                index: count,
                source,
            })?;
            self.import_song(&song, replace_user_data, delay)
                .map_err(|source| ImportError::Store {
                    sha1: song.sha1.clone(),
                    source,
                })?;
            count += 1;
        }
        info!("Imported {} song(s)", count);
        Ok(count)
    }

    pub fn get_song(&self, id: u64) -> Result<SongRecord, StoreError> {
        let key = CacheKey::Song(id);
        if let Some(record) = self.cache.get::<SongRecord>(&key) {
            return Ok(record);
        }
        let record = self
            .store
            .get(Kind::Live, id)?
            .ok_or(StoreError::NotFound(id))?;
        self.cache.fill(&key, &record);
        Ok(record)
    }

    /// The song with its plays, sorted by start time.
    pub fn dump_song(&self, id: u64) -> Result<Song, StoreError> {
        let record = self.get_song(id)?;
        let mut plays = self
            .store
            .plays(Kind::Live, id, self.config.max_plays_per_dump)?;
        plays.sort();
        Ok(record.to_song(plays))
    }

    pub fn delete_song(&self, id: u64) -> Result<SongRecord, StoreError> {
        let key = CacheKey::Song(id);
        self.cache.evict(&key);
        let record = self.store.delete(id)?;
        self.cache.evict(&key);
        self.cache.flush_for_update(UpdateTypes::METADATA);
        info!("Deleted song {} ({:?})", id, record.filename);
        Ok(record)
    }

    /// Records a play. Returns false when an identical play was already stored.
    pub fn add_play(&self, id: u64, play: &Play) -> Result<bool, StoreError> {
        let key = CacheKey::Song(id);
        self.cache.evict(&key);
        self.cache.flush_for_update(UpdateTypes::PLAYS);
        match self.store.add_play(id, play)? {
            Some(record) => {
                self.cache.write_after(&key, &record);
                self.cache.flush_for_update(UpdateTypes::PLAYS);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn rate_and_tag(
        &self,
        id: u64,
        rating: Option<f64>,
        tags: Option<&[String]>,
        delay: Duration,
    ) -> Result<SongRecord, StoreError> {
        let key = CacheKey::Song(id);
        let mut expected = UpdateTypes::default();
        if rating.is_some() {
            expected |= UpdateTypes::RATING;
        }
        if tags.is_some() {
            expected |= UpdateTypes::TAGS;
        }
        self.cache.evict(&key);
        self.cache.flush_for_update(expected);

        let (record, updates) = self.store.set_rating_and_tags(id, rating, tags, delay)?;
        self.cache.write_after(&key, &record);
        self.cache.flush_for_update(updates);
        Ok(record)
    }

    /// Every tag in use by a live song, sorted.
    pub fn tags(&self) -> Result<Vec<String>, StoreError> {
        if let Some(tags) = self.cache.get::<Vec<String>>(&CacheKey::Tags) {
            return Ok(tags);
        }
        let mut tags = BTreeSet::new();
        let mut after = None;
        loop {
            let (page, next) = self.store.scan_songs(Kind::Live, after, SCAN_PAGE, |_| true)?;
            for record in page {
                tags.extend(record.tags);
            }
            match next {
                Some(id) => after = Some(id),
                None => break,
            }
        }
        let tags: Vec<String> = tags.into_iter().collect();
        self.cache.fill(&CacheKey::Tags, &tags);
        Ok(tags)
    }

    pub fn query(&self, query: &SongQuery) -> Result<Vec<SongRecord>, StoreError> {
        let ids = self.query_ids(query)?;
        let ids = finalize_ids(query, ids);
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_song(id) {
                Ok(record) => records.push(record),
                // Deleted between the cached ID list and now.
                Err(StoreError::NotFound(_)) => debug!("Skipping vanished song {}", id),
                Err(err) => return Err(err),
            }
        }
        if !query.shuffle {
            sort_records(&mut records);
        }
        Ok(records)
    }

    fn query_ids(&self, query: &SongQuery) -> Result<Vec<u64>, StoreError> {
        let cacheable = self.config.cache_queries && query.can_cache();
        let key = CacheKey::Query(query.hash());
        if cacheable {
            if let Some(cached) = self.cache.get::<CachedQuery>(&key) {
                if cached.query == *query {
                    debug!("Using {} cached result(s)", cached.ids.len());
                    return Ok(cached.ids);
                }
            }
        }

        let mut matched = Vec::new();
        let mut after = None;
        loop {
            let (page, next) =
                self.store
                    .scan_songs(Kind::Live, after, SCAN_PAGE, |record| query.matches(record))?;
            matched.extend(page);
            match next {
                Some(id) => after = Some(id),
                None => break,
            }
        }
        sort_records(&mut matched);
        let ids: Vec<u64> = matched.iter().map(|record| record.id).collect();
        if cacheable {
            self.cache.fill(
                &key,
                &CachedQuery {
                    query: query.clone(),
                    ids: ids.clone(),
                },
            );
        }
        Ok(ids)
    }

    /// Recomputes derived fields for one page of songs. Returns the next cursor
    /// (empty once the pass is complete).
    pub fn reindex(&self, cursor: &str, max: usize) -> Result<(usize, usize, String), StoreError> {
        let after = parse_song_cursor(cursor)?;
        let (scanned, updated, next) = self.store.reindex(after, max)?;
        // Cached records carry the old derived fields.
        if updated > 0 {
            if let Err(err) = self.cache.flush(false) {
                warn!("Flushing cache after reindex failed: {}", err);
            }
        }
        Ok((scanned, updated, next.map(|id| id.to_string()).unwrap_or_default()))
    }

    pub fn flush_cache(&self, only_memory: bool) -> Result<(), CacheError> {
        self.cache.flush(only_memory)?;
        info!("Flushed {} cache", if only_memory { "memory" } else { "all" });
        Ok(())
    }
}

#[derive(Debug)]
pub enum ImportError {
    Decode { index: usize, source: serde_json::Error },
    Store { sha1: String, source: StoreError },
}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportError::Decode { index, source } => {
                write!(f, "decoding song {} failed: {}", index, source)
            }
            ImportError::Store { sha1, source } => {
                write!(f, "updating song with SHA1 {} failed: {}", sha1, source)
            }
        }
    }
}

impl std::error::Error for ImportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ImportError::Decode { source, .. } => Some(source),
            ImportError::Store { source, .. } => Some(source),
        }
    }
}

/// Song cursors are the decimal ID of the last song on the previous page.
pub(crate) fn parse_song_cursor(cursor: &str) -> Result<Option<u64>, StoreError> {
    let cursor = cursor.trim();
    if cursor.is_empty() {
        return Ok(None);
    }
    cursor
        .parse()
        .map(Some)
        .map_err(|_| StoreError::Cursor(cursor.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::open_or_create_db;
    use std::thread;
    use time::macros::datetime;

    pub fn temp_catalog() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let db = open_or_create_db(&dir.path().join("catalog.redb")).unwrap();
        let store = SongStore::new(Arc::new(db));
        store.init_tables().unwrap();
        let cache_db = open_or_create_db(&dir.path().join("cache.redb")).unwrap();
        let catalog = Catalog::with_tiers(
            store,
            Some(Arc::new(cache_db)),
            Arc::new(ServerConfig::default()),
        )
        .unwrap();
        (dir, catalog)
    }

    pub fn song(sha1: &str, title: &str) -> Song {
        Song {
            sha1: sha1.into(),
            filename: format!("{}.mp3", title),
            artist: "Artist".into(),
            title: title.into(),
            album: "Album".into(),
            track: 1,
            disc: 1,
            length: 200.0,
            ..Song::default()
        }
    }

    #[test]
    fn reimport_without_replacement_keeps_user_data() {
        let (_dir, catalog) = temp_catalog();
        let id = catalog.import_song(&song("X", "Old"), false, Duration::ZERO).unwrap().id;
        assert_eq!(catalog.get_song(id).unwrap().rating, common::UNRATED);

        let tags = vec!["electronic".to_string(), "instrumental".to_string()];
        catalog
            .rate_and_tag(id, Some(0.75), Some(&tags), Duration::ZERO)
            .unwrap();
        for (hour, ip) in [(1, "10.0.0.1"), (2, "10.0.0.1"), (3, "10.0.0.2")] {
            let start = datetime!(2023-04-01 0:00 UTC) + time::Duration::hours(hour);
            assert!(catalog.add_play(id, &Play::new(start, ip)).unwrap());
        }

        let mut updated = song("X", "New");
        updated.artist = "New Artist".into();
        updated.rating = 0.0;
        let record = catalog.import_song(&updated, false, Duration::ZERO).unwrap();
        assert_eq!(record.id, id);

        let dumped = catalog.dump_song(id).unwrap();
        assert_eq!(dumped.title, "New");
        assert_eq!(dumped.artist, "New Artist");
        assert_eq!(dumped.rating, 0.75);
        assert_eq!(dumped.tags, tags);
        assert_eq!(dumped.plays.len(), 3);
        assert_eq!(catalog.get_song(id).unwrap().num_plays, 3);
    }

    #[test]
    fn duplicate_play_is_ignored() {
        let (_dir, catalog) = temp_catalog();
        let id = catalog.import_song(&song("X", "T"), false, Duration::ZERO).unwrap().id;
        let play = Play::new(datetime!(2023-04-01 12:00 UTC), "10.0.0.1");
        assert!(catalog.add_play(id, &play).unwrap());
        assert!(!catalog.add_play(id, &play).unwrap());
        assert_eq!(catalog.get_song(id).unwrap().num_plays, 1);
        assert_eq!(catalog.dump_song(id).unwrap().plays, vec![play]);
    }

    #[test]
    fn deleted_song_leaves_queries() {
        let (_dir, catalog) = temp_catalog();
        let keep = catalog.import_song(&song("A", "Keep"), false, Duration::ZERO).unwrap().id;
        let gone = catalog.import_song(&song("B", "Gone"), false, Duration::ZERO).unwrap().id;
        let everything = SongQuery::default();
        assert_eq!(catalog.query(&everything).unwrap().len(), 2);

        catalog.delete_song(gone).unwrap();
        let ids: Vec<u64> = catalog.query(&everything).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![keep]);
        assert!(matches!(catalog.get_song(gone), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn slow_update_does_not_leave_stale_cache() {
        let (_dir, catalog) = temp_catalog();
        let id = catalog.import_song(&song("X", "T"), false, Duration::ZERO).unwrap().id;
        catalog.rate_and_tag(id, Some(0.25), None, Duration::ZERO).unwrap();

        let writer = {
            let catalog = catalog.clone();
            thread::spawn(move || {
                catalog
                    .rate_and_tag(id, Some(0.5), None, Duration::from_millis(300))
                    .unwrap()
            })
        };
        thread::sleep(Duration::from_millis(100));
        assert_eq!(catalog.get_song(id).unwrap().rating, 0.25);
        writer.join().unwrap();
        assert_eq!(catalog.get_song(id).unwrap().rating, 0.5);
        assert_eq!(catalog.get_song(id).unwrap().rating, 0.5);
    }

    #[test]
    fn rating_update_refreshes_cached_query() {
        let (_dir, catalog) = temp_catalog();
        let id = catalog.import_song(&song("X", "T"), false, Duration::ZERO).unwrap().id;
        let rated = SongQuery {
            min_rating: Some(0.5),
            ..SongQuery::default()
        };
        assert!(catalog.query(&rated).unwrap().is_empty());
        catalog.rate_and_tag(id, Some(0.75), None, Duration::ZERO).unwrap();
        assert_eq!(catalog.query(&rated).unwrap().len(), 1);
    }

    #[test]
    fn tag_list_follows_updates() {
        let (_dir, catalog) = temp_catalog();
        let id = catalog.import_song(&song("X", "T"), false, Duration::ZERO).unwrap().id;
        assert!(catalog.tags().unwrap().is_empty());
        let tags = vec!["Rock".to_string(), "live".to_string()];
        catalog.rate_and_tag(id, None, Some(&tags), Duration::ZERO).unwrap();
        assert_eq!(catalog.tags().unwrap(), vec!["live", "rock"]);
    }

    #[test]
    fn import_stops_at_first_failure() {
        let (_dir, catalog) = temp_catalog();
        let first = catalog.import_song(&song("X", "T"), false, Duration::ZERO).unwrap();
        {
            // Corrupt the index so the hash maps to two songs.
            let write_txn = catalog.store.db.begin_write().unwrap();
            {
                let mut index = write_txn.open_multimap_table(crate::store::SHA1_INDEX).unwrap();
                index.insert("X", first.id + 100).unwrap();
            }
            write_txn.commit().unwrap();
        }
        let songs = vec![song("Y", "Before"), song("X", "T"), song("Z", "After")];
        let err = catalog
            .import(songs.into_iter().map(Ok), false, Duration::ZERO)
            .unwrap_err();
        assert!(err.to_string().contains("found 2 songs with SHA1 X"));
        assert!(matches!(err, ImportError::Store { .. }));
        assert_eq!(catalog.store.ids_for_sha1("Y").unwrap().len(), 1);
        assert!(catalog.store.ids_for_sha1("Z").unwrap().is_empty());
    }

    #[test]
    fn undecodable_song_ends_import() {
        let (_dir, catalog) = temp_catalog();
        let body = br#"{"sha1":"A","artist":"a","title":"t","album":"b"} {"sha1": 5}"#;
        let songs = serde_json::Deserializer::from_slice(body).into_iter::<Song>();
        let err = catalog.import(songs, false, Duration::ZERO).unwrap_err();
        assert!(matches!(err, ImportError::Decode { index: 1, .. }));
        assert_eq!(catalog.store.ids_for_sha1("A").unwrap().len(), 1);
    }

    #[test]
    fn cursors_must_be_numeric() {
        assert_eq!(parse_song_cursor("").unwrap(), None);
        assert_eq!(parse_song_cursor("42").unwrap(), Some(42));
        assert!(matches!(parse_song_cursor("abc"), Err(StoreError::Cursor(_))));
    }
}
