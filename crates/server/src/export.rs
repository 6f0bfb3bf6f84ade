use common::{PlayDump, Song};
use serde::Serialize;
use time::OffsetDateTime;

use crate::catalog::{parse_song_cursor, Catalog};
use crate::store::{Kind, StoreError};

/// Song fields a consumer asked to leave out of an export.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Omit {
    pub plays: bool,
    pub cover_filename: bool,
    pub sha1: bool,
}

impl Omit {
    /// Parses a comma-separated list. Unknown names are ignored.
    pub fn parse(list: &str) -> Self {
        let mut omit = Omit::default();
        for name in list.split(',').map(str::trim) {
            match name {
                "plays" => omit.plays = true,
                "coverFilename" => omit.cover_filename = true,
                "sha1" => omit.sha1 = true,
                _ => {}
            }
        }
        omit
    }

    fn apply(&self, song: &mut Song) {
        if self.plays {
            song.plays.clear();
        }
        if self.cover_filename {
            song.cover_filename.clear();
        }
        if self.sha1 {
            song.sha1.clear();
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SongExport {
    pub cursor: String,
    pub deleted: bool,
    pub min_last_modified: Option<OffsetDateTime>,
    pub max: Option<usize>,
    pub omit: Omit,
}

#[derive(Clone, Debug)]
pub struct ExportPage<T> {
    pub items: Vec<T>,
    pub cursor: Option<String>,
}

impl Catalog {
    fn page_size(&self, max: Option<usize>) -> usize {
        let config = self.config();
        max.unwrap_or(config.export_default_max)
            .clamp(1, config.export_max.max(1))
    }

    /// One page of live or deleted songs in ID order.
    pub fn export_songs(&self, request: &SongExport) -> Result<ExportPage<Song>, StoreError> {
        let kind = if request.deleted {
            Kind::Deleted
        } else {
            Kind::Live
        };
        let after = parse_song_cursor(&request.cursor)?;
        let max = self.page_size(request.max);
        let min = request.min_last_modified;
        let (records, next) = self.store.scan_songs(kind, after, max, |record| {
            min.map_or(true, |min| record.last_modified >= min)
        })?;

        let mut items = Vec::with_capacity(records.len());
        for record in records {
            let plays = if request.omit.plays {
                Vec::new()
            } else {
                let mut plays = self
                    .store
                    .plays(kind, record.id, self.config().max_plays_per_dump)?;
                plays.sort();
                plays
            };
            let mut song = record.to_song(plays);
            request.omit.apply(&mut song);
            items.push(song);
        }
        Ok(ExportPage {
            items,
            cursor: next.map(|id| id.to_string()),
        })
    }

    /// One page of live plays, each tagged with its song's ID.
    pub fn export_plays(&self, cursor: &str, max: Option<usize>) -> Result<ExportPage<PlayDump>, StoreError> {
        let after = Some(cursor.trim()).filter(|cursor| !cursor.is_empty());
        let (plays, next) = self.store.scan_plays(after, self.page_size(max))?;
        let items = plays
            .into_iter()
            .map(|(id, play)| PlayDump {
                song_id: id.to_string(),
                play,
            })
            .collect();
        Ok(ExportPage { items, cursor: next })
    }
}

/// One JSON value per line, followed by the cursor as a JSON string when there is one.
pub fn render_ndjson<T: Serialize>(page: &ExportPage<T>) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    for item in &page.items {
        out.push_str(&serde_json::to_string(item)?);
        out.push('\n');
    }
    if let Some(cursor) = &page.cursor {
        out.push_str(&serde_json::to_string(cursor)?);
        out.push('\n');
    }
    Ok(out)
}
