use std::thread;
use std::time::Duration;

use common::{clean_tags, Play, Song};
use redb::{ReadableMultimapTable, ReadableTable, Table};
use time::OffsetDateTime;
use tracing::debug;

use crate::cache::UpdateTypes;
use crate::store::{
    decode_value, encode_value, play_key, play_range, play_seq, SongRecord, SongStore,
    StoreError, DELETED_PLAYS_TABLE, DELETED_SONGS_TABLE, META_TABLE, NEXT_SONG_ID_KEY,
    PLAYS_TABLE, SHA1_INDEX, SONGS_TABLE,
};

#[derive(Clone, Debug)]
pub struct Merged {
    pub record: SongRecord,
    pub inserted: bool,
    pub updates: UpdateTypes,
}

impl SongStore {
    /// Inserts or updates the song with `song.sha1`.
    ///
    /// The hash lookup is repeated inside the write transaction, so concurrent
    /// imports of one new hash produce a single record.
    pub fn upsert(
        &self,
        song: &Song,
        replace_user_data: bool,
        delay: Duration,
    ) -> Result<Merged, StoreError> {
        let write_txn = self.db.begin_write()?;
        let merged = {
            let mut index = write_txn.open_multimap_table(SHA1_INDEX)?;
            let mut songs = write_txn.open_table(SONGS_TABLE)?;
            let mut plays = write_txn.open_table(PLAYS_TABLE)?;

            let mut ids = Vec::new();
            for id in index.get(song.sha1.as_str())? {
                ids.push(id?.value());
            }
            if ids.len() > 1 {
                return Err(StoreError::Integrity {
                    sha1: song.sha1.clone(),
                    count: ids.len(),
                });
            }

            let now = OffsetDateTime::now_utc();
            let (mut record, inserted) = match ids.first() {
                Some(&id) => {
                    let mut record: SongRecord = match songs.get(id)? {
                        Some(value) => decode_value(value.value())?,
                        None => return Err(StoreError::NotFound(id)),
                    };
                    debug!("Updating {:?} with SHA1 {}", song.filename, song.sha1);
                    record.set_metadata(song);
                    (record, false)
                }
                None => {
                    let id = {
                        let mut meta = write_txn.open_table(META_TABLE)?;
                        let id = meta
                            .get(NEXT_SONG_ID_KEY)?
                            .map(|value| value.value())
                            .unwrap_or(1);
                        meta.insert(NEXT_SONG_ID_KEY, id + 1)?;
                        id
                    };
                    debug!("Inserting {:?} with SHA1 {} as {}", song.filename, song.sha1, id);
                    (SongRecord::new(id, song, now), true)
                }
            };

            let mut updates = UpdateTypes::METADATA;
            if replace_user_data {
                record.set_rating(song.rating);
                record.tags = clean_tags(&song.tags);
                let mut new_plays = song.plays.clone();
                new_plays.sort();
                new_plays.dedup();
                replace_plays(&mut plays, record.id, &new_plays)?;
                record.rebuild_play_stats(&new_plays);
                updates |= UpdateTypes::RATING | UpdateTypes::TAGS | UpdateTypes::PLAYS;
            }
            record.last_modified = now;

            if !delay.is_zero() {
                thread::sleep(delay);
            }
            let bytes = encode_value(&record)?;
            songs.insert(record.id, bytes.as_slice())?;
            if inserted {
                index.insert(record.sha1.as_str(), record.id)?;
            }
            Merged {
                record,
                inserted,
                updates,
            }
        };
        write_txn.commit()?;
        Ok(merged)
    }

    /// Appends a play. Returns `None` when the song already has an identical play.
    pub fn add_play(&self, id: u64, play: &Play) -> Result<Option<SongRecord>, StoreError> {
        let write_txn = self.db.begin_write()?;
        let record = {
            let mut songs = write_txn.open_table(SONGS_TABLE)?;
            let mut plays = write_txn.open_table(PLAYS_TABLE)?;
            let mut record: SongRecord = match songs.get(id)? {
                Some(value) => decode_value(value.value())?,
                None => return Err(StoreError::NotFound(id)),
            };

            let (start, end) = play_range(id);
            let mut next_seq = 0;
            for entry in plays.range(start.as_str()..end.as_str())? {
                let entry = entry?;
                let existing: Play = decode_value(entry.1.value())?;
                if existing == *play {
                    debug!(
                        "Already have play for song {} starting at {} from {}",
                        id, play.start_time, play.ip_address
                    );
                    return Ok(None);
                }
                if let Some(seq) = play_seq(entry.0.value()) {
                    next_seq = next_seq.max(seq + 1);
                }
            }

            let bytes = encode_value(play)?;
            plays.insert(play_key(id, next_seq).as_str(), bytes.as_slice())?;
            record.record_play(play.start_time);
            record.last_modified = OffsetDateTime::now_utc();
            let bytes = encode_value(&record)?;
            songs.insert(id, bytes.as_slice())?;
            record
        };
        write_txn.commit()?;
        Ok(Some(record))
    }

    /// Updates rating and/or tags. Nothing is written when neither changes.
    pub fn set_rating_and_tags(
        &self,
        id: u64,
        rating: Option<f64>,
        tags: Option<&[String]>,
        delay: Duration,
    ) -> Result<(SongRecord, UpdateTypes), StoreError> {
        let write_txn = self.db.begin_write()?;
        let result = {
            let mut songs = write_txn.open_table(SONGS_TABLE)?;
            let mut record: SongRecord = match songs.get(id)? {
                Some(value) => decode_value(value.value())?,
                None => return Err(StoreError::NotFound(id)),
            };

            let mut updates = UpdateTypes::default();
            if let Some(rating) = rating {
                let before = record.rating;
                record.set_rating(rating);
                if record.rating != before {
                    updates |= UpdateTypes::RATING;
                }
            }
            if let Some(tags) = tags {
                let cleaned = clean_tags(tags);
                if cleaned != record.tags {
                    record.tags = cleaned;
                    updates |= UpdateTypes::TAGS;
                }
            }
            if updates.is_empty() {
                debug!("Song {} wasn't changed", id);
                return Ok((record, updates));
            }

            record.last_modified = OffsetDateTime::now_utc();
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            let bytes = encode_value(&record)?;
            songs.insert(id, bytes.as_slice())?;
            (record, updates)
        };
        write_txn.commit()?;
        Ok(result)
    }

    /// Moves the song and its plays to the tombstone tables under the same ID.
    pub fn delete(&self, id: u64) -> Result<SongRecord, StoreError> {
        let write_txn = self.db.begin_write()?;
        let record = {
            let mut songs = write_txn.open_table(SONGS_TABLE)?;
            let mut plays = write_txn.open_table(PLAYS_TABLE)?;
            let mut index = write_txn.open_multimap_table(SHA1_INDEX)?;
            let mut record: SongRecord = match songs.remove(id)? {
                Some(value) => decode_value(value.value())?,
                None => return Err(StoreError::NotFound(id)),
            };
            index.remove(record.sha1.as_str(), id)?;

            let (start, end) = play_range(id);
            let mut removed = Vec::new();
            for entry in plays.range(start.as_str()..end.as_str())? {
                let entry = entry?;
                removed.push((entry.0.value().to_string(), entry.1.value().to_vec()));
            }
            for (key, _) in &removed {
                plays.remove(key.as_str())?;
            }

            record.last_modified = OffsetDateTime::now_utc();
            let mut deleted_songs = write_txn.open_table(DELETED_SONGS_TABLE)?;
            let bytes = encode_value(&record)?;
            deleted_songs.insert(id, bytes.as_slice())?;
            let mut deleted_plays = write_txn.open_table(DELETED_PLAYS_TABLE)?;
            for (key, value) in &removed {
                deleted_plays.insert(key.as_str(), value.as_slice())?;
            }
            debug!("Deleted song {} with {} play(s)", id, removed.len());
            record
        };
        write_txn.commit()?;
        Ok(record)
    }

    /// Recomputes derived fields for up to `max` songs after `after`.
    /// Returns (scanned, updated, cursor for the next step).
    pub fn reindex(
        &self,
        after: Option<u64>,
        max: usize,
    ) -> Result<(usize, usize, Option<u64>), StoreError> {
        let (page, next) = self.scan_songs(crate::store::Kind::Live, after, max, |_| true)?;
        let write_txn = self.db.begin_write()?;
        let updated = {
            let mut songs = write_txn.open_table(SONGS_TABLE)?;
            let mut updated = 0;
            for candidate in &page {
                let mut record: SongRecord = match songs.get(candidate.id)? {
                    Some(value) => decode_value(value.value())?,
                    None => continue,
                };
                // Derived fields only; last-modified stays put.
                if record.reindex() {
                    let bytes = encode_value(&record)?;
                    songs.insert(record.id, bytes.as_slice())?;
                    updated += 1;
                }
            }
            updated
        };
        write_txn.commit()?;
        debug!("Scanned {} songs for reindex, updated {}", page.len(), updated);
        Ok((page.len(), updated, next))
    }
}

fn replace_plays(
    plays: &mut Table<&str, &[u8]>,
    id: u64,
    new_plays: &[Play],
) -> Result<(), StoreError> {
    let (start, end) = play_range(id);
    let mut old_keys = Vec::new();
    for entry in plays.range(start.as_str()..end.as_str())? {
        old_keys.push(entry?.0.value().to_string());
    }
    for key in &old_keys {
        plays.remove(key.as_str())?;
    }
    for (seq, play) in new_plays.iter().enumerate() {
        let bytes = encode_value(play)?;
        plays.insert(play_key(id, seq as u64).as_str(), bytes.as_slice())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::temp_store;
    use crate::store::Kind;
    use time::macros::datetime;

    fn song(sha1: &str) -> Song {
        Song {
            sha1: sha1.into(),
            filename: "a/b.mp3".into(),
            artist: "Artist".into(),
            title: "Title".into(),
            album: "Album".into(),
            track: 1,
            disc: 1,
            length: 180.5,
            ..Song::default()
        }
    }

    #[test]
    fn insert_then_update_keeps_id() {
        let (_dir, store) = temp_store();
        let first = store.upsert(&song("x"), false, Duration::ZERO).unwrap();
        assert!(first.inserted);
        assert_eq!(first.record.rating, common::UNRATED);

        let mut retitled = song("x");
        retitled.title = "New Title".into();
        let second = store.upsert(&retitled, false, Duration::ZERO).unwrap();
        assert!(!second.inserted);
        assert_eq!(second.record.id, first.record.id);
        assert_eq!(second.record.title_lower, "new title");
        assert!(second.record.last_modified >= first.record.last_modified);

        let other = store.upsert(&song("y"), false, Duration::ZERO).unwrap();
        assert_ne!(other.record.id, first.record.id);
        assert_eq!(store.ids_for_sha1("x").unwrap(), vec![first.record.id]);
    }

    #[test]
    fn update_without_replacement_preserves_user_data() {
        let (_dir, store) = temp_store();
        let id = store.upsert(&song("x"), false, Duration::ZERO).unwrap().record.id;
        let tags = vec!["Rock".to_string(), "mellow".to_string()];
        store
            .set_rating_and_tags(id, Some(0.5), Some(&tags), Duration::ZERO)
            .unwrap();
        store
            .add_play(id, &Play::new(datetime!(2020-01-01 0:00 UTC), "1.2.3.4"))
            .unwrap();

        let mut incoming = song("x");
        incoming.artist = "Renamed".into();
        incoming.rating = 1.0;
        incoming.tags = vec!["other".into()];
        let merged = store.upsert(&incoming, false, Duration::ZERO).unwrap().record;
        assert_eq!(merged.artist, "Renamed");
        assert_eq!(merged.rating, 0.5);
        assert_eq!(merged.tags, vec!["mellow", "rock"]);
        assert_eq!(merged.num_plays, 1);
        assert_eq!(store.plays(Kind::Live, id, 10).unwrap().len(), 1);
    }

    #[test]
    fn replacement_supersedes_plays_and_tags() {
        let (_dir, store) = temp_store();
        let id = store.upsert(&song("x"), false, Duration::ZERO).unwrap().record.id;
        store
            .add_play(id, &Play::new(datetime!(2019-01-01 0:00 UTC), "old"))
            .unwrap();

        let new_plays = vec![
            Play::new(datetime!(2022-03-01 0:00 UTC), "b"),
            Play::new(datetime!(2021-03-01 0:00 UTC), "a"),
        ];
        let mut incoming = song("x");
        incoming.rating = 0.25;
        incoming.tags = vec!["b".into(), "A".into(), "b".into()];
        incoming.plays = new_plays.clone();
        let merged = store.upsert(&incoming, true, Duration::ZERO).unwrap();
        assert!(merged.updates.contains(UpdateTypes::PLAYS));
        let record = merged.record;
        assert_eq!(record.rating, 0.25);
        assert_eq!(record.tags, vec!["a", "b"]);
        assert_eq!(record.num_plays, 2);
        assert_eq!(record.first_start_time, Some(datetime!(2021-03-01 0:00 UTC)));
        assert_eq!(record.last_start_time, Some(datetime!(2022-03-01 0:00 UTC)));

        let stored = store.plays(Kind::Live, id, 10).unwrap();
        assert_eq!(stored, vec![new_plays[1].clone(), new_plays[0].clone()]);
    }

    #[test]
    fn duplicate_play_is_a_no_op() {
        let (_dir, store) = temp_store();
        let id = store.upsert(&song("x"), false, Duration::ZERO).unwrap().record.id;
        let play = Play::new(datetime!(2020-06-01 12:00 UTC), "10.0.0.1");
        assert!(store.add_play(id, &play).unwrap().is_some());
        assert!(store.add_play(id, &play).unwrap().is_none());
        let other_ip = Play::new(play.start_time, "10.0.0.2");
        let record = store.add_play(id, &other_ip).unwrap().unwrap();
        assert_eq!(record.num_plays, 2);
        assert_eq!(store.plays(Kind::Live, id, 10).unwrap().len(), 2);
    }

    #[test]
    fn unchanged_rating_and_tags_write_nothing() {
        let (_dir, store) = temp_store();
        let id = store.upsert(&song("x"), false, Duration::ZERO).unwrap().record.id;
        let (first, updates) = store
            .set_rating_and_tags(id, Some(0.75), None, Duration::ZERO)
            .unwrap();
        assert_eq!(updates, UpdateTypes::RATING);
        let (second, updates) = store
            .set_rating_and_tags(id, Some(0.75), Some(&[]), Duration::ZERO)
            .unwrap();
        assert!(updates.is_empty());
        assert_eq!(second.last_modified, first.last_modified);
    }

    #[test]
    fn delete_moves_song_and_plays_to_tombstones() {
        let (_dir, store) = temp_store();
        let id = store.upsert(&song("x"), false, Duration::ZERO).unwrap().record.id;
        store
            .add_play(id, &Play::new(datetime!(2020-01-01 0:00 UTC), "a"))
            .unwrap();
        let deleted = store.delete(id).unwrap();
        assert_eq!(deleted.id, id);

        assert!(store.get(Kind::Live, id).unwrap().is_none());
        assert!(store.plays(Kind::Live, id, 10).unwrap().is_empty());
        assert!(store.ids_for_sha1("x").unwrap().is_empty());
        assert_eq!(store.get(Kind::Deleted, id).unwrap().unwrap().sha1, "x");
        assert_eq!(store.plays(Kind::Deleted, id, 10).unwrap().len(), 1);
        assert!(matches!(store.delete(id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn reindex_pages_through_songs() {
        let (_dir, store) = temp_store();
        for sha1 in ["a", "b", "c"] {
            store.upsert(&song(sha1), false, Duration::ZERO).unwrap();
        }
        let (scanned, updated, next) = store.reindex(None, 2).unwrap();
        assert_eq!((scanned, updated), (2, 0));
        let (scanned, _, next) = store.reindex(next, 2).unwrap();
        assert_eq!(scanned, 1);
        assert!(next.is_none());
    }
}
