use std::fs::File;
use std::io::{Seek, SeekFrom};

use lofty::config::ParseOptions;
use lofty::mpeg::MpegFile;
use lofty::prelude::{Accessor, AudioFile, ItemKey};
use lofty::tag::Tag;

use crate::{mpeg, DecodedTags, MetadataError, TagDecoder};

const ALBUM_ID_DESCRIPTION: &str = "MusicBrainz Album Id";
const COVER_ID_DESCRIPTION: &str = "nup Cover Id";

/// Reads ID3v2 tags with lofty.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoftyDecoder;

impl TagDecoder for LoftyDecoder {
    fn decode(&self, file: &mut File, _size: u64) -> Result<DecodedTags, MetadataError> {
        let header_len = mpeg::id3v2_len(file)?;
        if header_len == 0 {
            return Err(MetadataError::NoTag);
        }

        file.seek(SeekFrom::Start(0))?;
        let mpeg_file = MpegFile::read_from(file, ParseOptions::new().read_properties(false))?;
        let id3v2 = mpeg_file.id3v2().ok_or(MetadataError::NoTag)?;
        let album_id = id3v2.get_user_text(ALBUM_ID_DESCRIPTION).map(str::to_string);
        let cover_id = id3v2.get_user_text(COVER_ID_DESCRIPTION).map(str::to_string);
        let tag: Tag = id3v2.clone().into();

        Ok(DecodedTags {
            artist: tag.artist().map(|v| v.to_string()),
            title: tag.title().map(|v| v.to_string()),
            album: tag.album().map(|v| v.to_string()),
            album_artist: tag.get_string(&ItemKey::AlbumArtist).map(str::to_string),
            album_id: album_id
                .or_else(|| tag.get_string(&ItemKey::MusicBrainzReleaseId).map(str::to_string)),
            recording_id: tag
                .get_string(&ItemKey::MusicBrainzRecordingId)
                .map(str::to_string),
            cover_id,
            track: tag.track(),
            disc: tag.disk(),
            header_len,
        })
    }
}
