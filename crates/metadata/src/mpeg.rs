use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use sha1::{Digest, Sha1};

use crate::MetadataError;

pub const ID3V1_LEN: u64 = 128;
const ID3V1_MAGIC: &[u8; 3] = b"TAG";
const ID3V1_FIELD_LEN: usize = 30;

const ID3V2_HEADER_LEN: u64 = 10;
const ID3V2_FOOTER_FLAG: u8 = 0x10;

const FRAME_SYNC: u32 = 0x7ff;
const MPEG_VERSION_1: u32 = 0x3;
const LAYER_III: u32 = 0x1;
const CHANNEL_MODE_MONO: u32 = 0x3;
const SIDE_INFO_MONO: u64 = 17;
const SIDE_INFO_STEREO: u64 = 32;
const CRC_LEN: u64 = 2;

pub const SAMPLES_PER_FRAME: u64 = 1152;
const XING_FRAMES_FLAG: u32 = 0x1;

const BITRATES_KBPS: [u32; 16] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0,
];
const SAMPLE_RATES: [u32; 4] = [44100, 48000, 32000, 0];

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Id3v1Tag {
    pub title: String,
    pub artist: String,
    pub album: String,
}

/// Reads the legacy 128-byte trailer, if present.
pub fn read_id3v1(file: &mut File, size: u64) -> Result<Option<Id3v1Tag>, MetadataError> {
    if size < ID3V1_LEN {
        return Ok(None);
    }
    let mut buf = [0u8; ID3V1_LEN as usize];
    file.seek(SeekFrom::Start(size - ID3V1_LEN))?;
    file.read_exact(&mut buf)?;
    Ok(parse_id3v1(&buf))
}

pub fn parse_id3v1(buf: &[u8]) -> Option<Id3v1Tag> {
    if buf.len() < ID3V1_LEN as usize || &buf[..3] != ID3V1_MAGIC {
        return None;
    }
    let field = |index: usize| {
        let start = 3 + index * ID3V1_FIELD_LEN;
        latin1_field(&buf[start..start + ID3V1_FIELD_LEN])
    };
    Some(Id3v1Tag {
        title: field(0),
        artist: field(1),
        album: field(2),
    })
}

fn latin1_field(bytes: &[u8]) -> String {
    let text: String = bytes.iter().map(|&b| b as char).collect();
    text.trim_end_matches('\0').trim().to_string()
}

/// Returns the full length of a leading ID3v2 tag, or 0 when the file has none.
pub fn id3v2_len(file: &mut File) -> Result<u64, MetadataError> {
    let mut buf = [0u8; ID3V2_HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0))?;
    match file.read_exact(&mut buf) {
        Ok(()) => Ok(parse_id3v2_len(&buf)),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
        Err(err) => Err(err.into()),
    }
}

pub fn parse_id3v2_len(header: &[u8]) -> u64 {
    if header.len() < ID3V2_HEADER_LEN as usize || &header[..3] != b"ID3" {
        return 0;
    }
    let size = header[6..10]
        .iter()
        .fold(0u64, |acc, &b| (acc << 7) | u64::from(b & 0x7f));
    let footer = if header[5] & ID3V2_FOOTER_FLAG != 0 {
        ID3V2_HEADER_LEN
    } else {
        0
    };
    ID3V2_HEADER_LEN + size + footer
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kbps: u32,
    pub sample_rate: u32,
    pub mono: bool,
    pub has_crc: bool,
}

impl FrameHeader {
    /// Offset of a Xing/Info block relative to the start of the frame.
    pub fn xing_offset(&self) -> u64 {
        let side_info = if self.mono {
            SIDE_INFO_MONO
        } else {
            SIDE_INFO_STEREO
        };
        4 + side_info + if self.has_crc { CRC_LEN } else { 0 }
    }
}

fn bits(header: u32, start: u32, len: u32) -> u32 {
    (header << start) >> (32 - len)
}

pub fn parse_frame_header(header: u32, offset: u64) -> Result<FrameHeader, MetadataError> {
    let sync = bits(header, 0, 11);
    if sync != FRAME_SYNC {
        return Err(MetadataError::parse(
            offset,
            format!("missing sync at {:#x} (got {:#x} instead of {:#x})", offset, sync, FRAME_SYNC),
        ));
    }
    let version = bits(header, 11, 2);
    if version != MPEG_VERSION_1 {
        return Err(MetadataError::parse(
            offset,
            format!("unsupported MPEG version {:#x} at {:#x}", version, offset),
        ));
    }
    let layer = bits(header, 13, 2);
    if layer != LAYER_III {
        return Err(MetadataError::parse(
            offset,
            format!("unsupported layer {:#x} at {:#x}", layer, offset),
        ));
    }
    let bitrate_index = bits(header, 16, 4);
    let kbps = BITRATES_KBPS[bitrate_index as usize];
    if kbps == 0 {
        return Err(MetadataError::parse(
            offset,
            format!("unsupported bitrate index {:#x} at {:#x}", bitrate_index, offset),
        ));
    }
    let rate_index = bits(header, 20, 2);
    let sample_rate = SAMPLE_RATES[rate_index as usize];
    if sample_rate == 0 {
        return Err(MetadataError::parse(
            offset,
            format!("unsupported sample rate index {:#x} at {:#x}", rate_index, offset),
        ));
    }
    Ok(FrameHeader {
        kbps,
        sample_rate,
        mono: bits(header, 24, 2) == CHANNEL_MODE_MONO,
        has_crc: bits(header, 15, 1) == 0,
    })
}

/// Frame count from a Xing or Info block, if the block carries one.
pub fn parse_xing_frames(block: &[u8]) -> Option<u32> {
    if block.len() < 12 {
        return None;
    }
    if &block[..4] != b"Xing" && &block[..4] != b"Info" {
        return None;
    }
    let flags = u32::from_be_bytes([block[4], block[5], block[6], block[7]]);
    if flags & XING_FRAMES_FLAG == 0 {
        return None;
    }
    Some(u32::from_be_bytes([block[8], block[9], block[10], block[11]]))
}

pub fn vbr_duration_ms(frames: u32, sample_rate: u32) -> u64 {
    u64::from(frames) * SAMPLES_PER_FRAME * 1000 / u64::from(sample_rate)
}

/// Approximation for files without a frame count: audio bytes over the first frame's bitrate.
pub fn cbr_duration_ms(audio_bytes: u64, kbps: u32) -> u64 {
    audio_bytes * 8 / u64::from(kbps)
}

pub fn compute_duration_ms(
    file: &mut File,
    size: u64,
    header_len: u64,
    footer_len: u64,
) -> Result<u64, MetadataError> {
    let mut raw = [0u8; 4];
    file.seek(SeekFrom::Start(header_len))?;
    if let Err(err) = file.read_exact(&mut raw) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Err(MetadataError::parse(
                header_len,
                format!("no frame header at {:#x}", header_len),
            ));
        }
        return Err(err.into());
    }
    let frame = parse_frame_header(u32::from_be_bytes(raw), header_len)?;

    let mut block = [0u8; 12];
    file.seek(SeekFrom::Start(header_len + frame.xing_offset()))?;
    let frames = match file.read_exact(&mut block) {
        Ok(()) => parse_xing_frames(&block),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => None,
        Err(err) => return Err(err.into()),
    };

    Ok(match frames {
        Some(frames) => vbr_duration_ms(frames, frame.sample_rate),
        None => cbr_duration_ms(audio_len(size, header_len, footer_len)?, frame.kbps),
    })
}

fn audio_len(size: u64, header_len: u64, footer_len: u64) -> Result<u64, MetadataError> {
    size.checked_sub(header_len + footer_len).ok_or_else(|| {
        MetadataError::parse(
            header_len,
            format!(
                "tags ({} + {} bytes) exceed file size {}",
                header_len, footer_len, size
            ),
        )
    })
}

/// Hex SHA1 of the bytes between the leading tag and the trailer.
pub fn payload_sha1(
    file: &mut File,
    size: u64,
    header_len: u64,
    footer_len: u64,
) -> Result<String, MetadataError> {
    let len = audio_len(size, header_len, footer_len)?;
    file.seek(SeekFrom::Start(header_len))?;
    let mut hasher = Sha1::new();
    let copied = io::copy(&mut file.by_ref().take(len), &mut hasher)?;
    if copied != len {
        return Err(MetadataError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("read {} of {} audio bytes", copied, len),
        )));
    }
    Ok(hex::encode(hasher.finalize()))
}
