pub mod mpeg;
mod tags;

use std::fs::File;
use std::path::Path;

use common::{Song, NON_ALBUM_TRACKS};
use lofty::error::LoftyError;
use tracing::debug;

pub use tags::LoftyDecoder;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DecodedTags {
    pub artist: Option<String>,
    pub title: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub album_id: Option<String>,
    pub recording_id: Option<String>,
    pub cover_id: Option<String>,
    pub track: Option<u32>,
    pub disc: Option<u32>,
    /// Bytes occupied by the leading tag.
    pub header_len: u64,
}

/// Decodes the leading metadata tag of an audio file.
pub trait TagDecoder: Send + Sync {
    fn decode(&self, file: &mut File, size: u64) -> Result<DecodedTags, MetadataError>;
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
    Parse { offset: u64, message: String },
    MissingMetadata(String),
    NoTag,
}

impl MetadataError {
    pub(crate) fn parse(offset: u64, message: String) -> Self {
        MetadataError::Parse { offset, message }
    }
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
            MetadataError::Parse { message, .. } => write!(f, "parse error: {}", message),
            MetadataError::MissingMetadata(reason) => write!(f, "missing metadata: {}", reason),
            MetadataError::NoTag => write!(f, "no ID3v2 tag"),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

/// Builds a song from the file at `path`; `relpath` becomes its filename.
pub fn read_song(
    path: &Path,
    relpath: &str,
    decoder: &dyn TagDecoder,
) -> Result<Song, MetadataError> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();

    let mut song = Song {
        filename: relpath.to_string(),
        ..Song::default()
    };

    let mut footer_len = 0;
    if let Some(tag) = mpeg::read_id3v1(&mut file, size)? {
        footer_len = mpeg::ID3V1_LEN;
        song.artist = tag.artist;
        song.title = tag.title;
        song.album = tag.album;
    }

    let header_len = match decoder.decode(&mut file, size) {
        Ok(tags) => {
            apply_tags(&mut song, &tags);
            tags.header_len
        }
        Err(err) => {
            if song.artist.is_empty() || song.title.is_empty() {
                return Err(MetadataError::MissingMetadata(format!(
                    "{}: {}",
                    path.display(),
                    err
                )));
            }
            debug!("Using ID3v1 tag for {:?}: {}", path, err);
            0
        }
    };
    if song.artist.is_empty() && song.title.is_empty() {
        return Err(MetadataError::MissingMetadata(format!(
            "{}: no artist or title",
            path.display()
        )));
    }

    song.sha1 = mpeg::payload_sha1(&mut file, size, header_len, footer_len)?;
    let duration_ms = mpeg::compute_duration_ms(&mut file, size, header_len, footer_len)?;
    song.length = duration_ms as f64 / 1000.0;
    Ok(song)
}

/// Album ID of the file at `path`; empty when the tag is missing or undecodable.
pub fn read_album_id(path: &Path, decoder: &dyn TagDecoder) -> Result<String, MetadataError> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    Ok(match decoder.decode(&mut file, size) {
        Ok(tags) => tags.album_id.unwrap_or_default().trim().to_string(),
        Err(_) => String::new(),
    })
}

fn apply_tags(song: &mut Song, tags: &DecodedTags) {
    let set = |field: &mut String, value: &Option<String>| {
        if let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            *field = value.to_string();
        }
    };
    set(&mut song.artist, &tags.artist);
    set(&mut song.title, &tags.title);
    set(&mut song.album, &tags.album);
    set(&mut song.album_id, &tags.album_id);
    set(&mut song.recording_id, &tags.recording_id);
    set(&mut song.cover_id, &tags.cover_id);
    if let Some(album_artist) = tags.album_artist.as_deref().map(str::trim) {
        if album_artist != song.artist {
            song.album_artist = album_artist.to_string();
        }
    }
    song.track = tags.track.unwrap_or(0);
    song.disc = tags.disc.unwrap_or(0);
    if song.disc == 0 && song.track > 0 && song.album != NON_ALBUM_TRACKS {
        song.disc = 1;
    }
}
