use common::normalize;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use time::OffsetDateTime;

use crate::cache::UpdateTypes;
use crate::store::SongRecord;

pub const MAX_QUERY_RESULTS: usize = 250;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongQuery {
    pub artist: String,
    pub title: String,
    pub album: String,
    pub album_id: String,
    pub keywords: Vec<String>,
    pub min_rating: Option<f64>,
    pub unrated: bool,
    pub max_plays: Option<u32>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub min_first_played: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub max_last_played: Option<OffsetDateTime>,
    pub track: u32,
    pub disc: u32,
    pub max_disc: Option<u32>,
    pub tags: Vec<String>,
    pub not_tags: Vec<String>,
    pub shuffle: bool,
}

impl SongQuery {
    /// Hex SHA1 of the query's JSON form.
    pub fn hash(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha1::digest(&json))
    }

    /// Queries bounded by play count or play times depend on the clock and are never cached.
    pub fn can_cache(&self) -> bool {
        self.max_plays.is_none() && self.min_first_played.is_none() && self.max_last_played.is_none()
    }

    pub fn results_invalidated(&self, updates: UpdateTypes) -> bool {
        if updates.contains(UpdateTypes::METADATA) {
            return true;
        }
        if updates.contains(UpdateTypes::RATING) && (self.min_rating.is_some() || self.unrated) {
            return true;
        }
        if updates.contains(UpdateTypes::TAGS) && (!self.tags.is_empty() || !self.not_tags.is_empty())
        {
            return true;
        }
        updates.contains(UpdateTypes::PLAYS) && !self.can_cache()
    }

    pub fn matches(&self, record: &SongRecord) -> bool {
        let text = |wanted: &str, have: &str| wanted.is_empty() || normalize(wanted) == have;
        if !text(&self.artist, &record.artist_lower)
            || !text(&self.title, &record.title_lower)
            || !text(&self.album, &record.album_lower)
        {
            return false;
        }
        if !self.album_id.is_empty() && self.album_id != record.album_id {
            return false;
        }
        if !self
            .keywords
            .iter()
            .all(|word| record.keywords.binary_search(&normalize(word)).is_ok())
        {
            return false;
        }

        let unrated = record.rating < 0.0;
        match self.min_rating {
            Some(min) if !(record.rating >= min || (self.unrated && unrated)) => return false,
            None if self.unrated && !unrated => return false,
            _ => {}
        }
        if let Some(max) = self.max_plays {
            if record.num_plays > max {
                return false;
            }
        }
        if let Some(min) = self.min_first_played {
            if record.first_start_time.map_or(true, |first| first < min) {
                return false;
            }
        }
        if let Some(max) = self.max_last_played {
            if record.last_start_time.map_or(false, |last| last > max) {
                return false;
            }
        }

        if self.track > 0 && record.track != self.track {
            return false;
        }
        if self.disc > 0 && record.disc != self.disc {
            return false;
        }
        if let Some(max) = self.max_disc {
            if record.disc > max {
                return false;
            }
        }
        self.tags.iter().all(|tag| record.tags.contains(tag))
            && !self.not_tags.iter().any(|tag| record.tags.contains(tag))
    }
}

/// Result IDs cached for a query, stored beside the query so updates can test it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedQuery {
    pub query: SongQuery,
    pub ids: Vec<u64>,
}

/// Truncates to the result limit, shuffling first when asked.
pub fn finalize_ids(query: &SongQuery, mut ids: Vec<u64>) -> Vec<u64> {
    if query.shuffle {
        ids.shuffle(&mut rand::rng());
    }
    ids.truncate(MAX_QUERY_RESULTS);
    ids
}

pub fn sort_records(records: &mut [SongRecord]) {
    records.sort_by(|a, b| {
        a.album_lower
            .cmp(&b.album_lower)
            .then_with(|| a.album_id.cmp(&b.album_id))
            .then(a.disc.cmp(&b.disc))
            .then(a.track.cmp(&b.track))
            .then_with(|| a.artist_lower.cmp(&b.artist_lower))
            .then_with(|| a.title_lower.cmp(&b.title_lower))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Song;
    use time::macros::datetime;

    fn record() -> SongRecord {
        let song = Song {
            artist: "Sigur Rós".into(),
            title: "Svefn-g-englar".into(),
            album: "Ágætis byrjun".into(),
            album_id: "abc".into(),
            track: 2,
            disc: 1,
            tags: vec!["ambient".into()],
            ..Song::default()
        };
        let mut record = SongRecord::new(1, &song, datetime!(2024-01-01 0:00 UTC));
        record.tags = vec!["ambient".into(), "post-rock".into()];
        record
    }

    #[test]
    fn hash_depends_on_fields() {
        let a = SongQuery {
            artist: "x".into(),
            ..SongQuery::default()
        };
        let b = SongQuery {
            artist: "y".into(),
            ..SongQuery::default()
        };
        assert_eq!(a.hash().len(), 40);
        assert_eq!(a.hash(), a.clone().hash());
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn time_bounded_queries_are_not_cached() {
        assert!(SongQuery::default().can_cache());
        let plays = SongQuery {
            max_plays: Some(3),
            ..SongQuery::default()
        };
        assert!(!plays.can_cache());
        let recent = SongQuery {
            min_first_played: Some(datetime!(2020-01-01 0:00 UTC)),
            ..SongQuery::default()
        };
        assert!(!recent.can_cache());
    }

    #[test]
    fn invalidation_follows_query_fields() {
        let plain = SongQuery::default();
        assert!(plain.results_invalidated(UpdateTypes::METADATA));
        assert!(!plain.results_invalidated(UpdateTypes::RATING | UpdateTypes::TAGS | UpdateTypes::PLAYS));

        let rated = SongQuery {
            min_rating: Some(0.5),
            ..SongQuery::default()
        };
        assert!(rated.results_invalidated(UpdateTypes::RATING));
        assert!(!rated.results_invalidated(UpdateTypes::TAGS));

        let tagged = SongQuery {
            not_tags: vec!["christmas".into()],
            ..SongQuery::default()
        };
        assert!(tagged.results_invalidated(UpdateTypes::TAGS));
        assert!(!tagged.results_invalidated(UpdateTypes::PLAYS));
    }

    #[test]
    fn matches_normalized_text_and_keywords() {
        let record = record();
        let query = SongQuery {
            artist: "sigur ros".into(),
            keywords: vec!["Byrjun".into()],
            ..SongQuery::default()
        };
        assert!(query.matches(&record));
        let miss = SongQuery {
            keywords: vec!["takk".into()],
            ..SongQuery::default()
        };
        assert!(!miss.matches(&record));
    }

    #[test]
    fn matches_rating_and_tags() {
        let mut record = record();
        let unrated = SongQuery {
            unrated: true,
            ..SongQuery::default()
        };
        assert!(unrated.matches(&record));
        let min = SongQuery {
            min_rating: Some(0.5),
            ..SongQuery::default()
        };
        assert!(!min.matches(&record));
        record.rating = 0.75;
        assert!(min.matches(&record));
        assert!(!unrated.matches(&record));

        let tags = SongQuery {
            tags: vec!["ambient".into()],
            not_tags: vec!["post-rock".into()],
            ..SongQuery::default()
        };
        assert!(!tags.matches(&record));
    }

    #[test]
    fn matches_play_bounds() {
        let mut record = record();
        let before = SongQuery {
            max_last_played: Some(datetime!(2020-01-01 0:00 UTC)),
            ..SongQuery::default()
        };
        assert!(before.matches(&record));
        record.record_play(datetime!(2021-01-01 0:00 UTC));
        assert!(!before.matches(&record));

        let first = SongQuery {
            min_first_played: Some(datetime!(2020-06-01 0:00 UTC)),
            max_plays: Some(1),
            ..SongQuery::default()
        };
        assert!(first.matches(&record));
        record.record_play(datetime!(2019-01-01 0:00 UTC));
        assert!(!first.matches(&record));
    }

    #[test]
    fn results_are_truncated() {
        let ids: Vec<u64> = (0..(MAX_QUERY_RESULTS as u64 + 10)).collect();
        let query = SongQuery {
            shuffle: true,
            ..SongQuery::default()
        };
        let out = finalize_ids(&query, ids);
        assert_eq!(out.len(), MAX_QUERY_RESULTS);
    }
}
