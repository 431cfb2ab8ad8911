//! Best-effort metadata tag scanning.
//!
//! Tag blocks in front of or behind the audio payload are hidden from decoders
//! by narrowing the source's [`ByteRange`]. The tags themselves are read with
//! `lofty` and end up in the audio's [`Properties`].

use super::source::{ByteRange, ByteSource};
use crate::error::Result;
use crate::properties::Properties;
use lofty::config::{ParseOptions, ParsingMode};
use lofty::file::{FileType, TaggedFileExt};
use lofty::probe::Probe;
use lofty::tag::{Accessor, ItemKey, Tag, TagType};
use std::io::{Cursor, Read, Seek, SeekFrom};

pub trait TagParser: Send + Sync {
    fn name(&self) -> &'static str;

    /// Narrows `range` to exclude tag bytes and records metadata in `props`.
    /// Returns whether any tag block was found.
    fn parse(
        &self,
        source: &ByteSource,
        range: &mut ByteRange,
        props: &mut Properties,
    ) -> Result<bool>;
}

/// Leading ID3v2 plus trailing ID3v1 and APEv2 blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct Id3TagParser;

const ID3V1_LEN: u64 = 128;
const APE_FOOTER_LEN: u64 = 32;
const APE_HAS_HEADER: u32 = 1 << 31;
/// MPEG-1 Layer III, 128 kbit/s, 44.1 kHz, no padding
const MPEG_FRAME_HEADER: [u8; 4] = [0xff, 0xfb, 0x90, 0x64];
const MPEG_FRAME_LEN: usize = 417;

impl TagParser for Id3TagParser {
    fn name(&self) -> &'static str {
        "ID3/APE"
    }

    fn parse(
        &self,
        source: &ByteSource,
        range: &mut ByteRange,
        props: &mut Properties,
    ) -> Result<bool> {
        let mut reader = source.open(*range)?;
        let len = reader.len();
        let mut start = 0u64;
        let mut end = len;

        // Some encoders stack several ID3v2 tags
        while end - start >= 10 {
            reader.seek(SeekFrom::Start(start))?;
            let mut header = [0u8; 10];
            reader.read_exact(&mut header)?;
            if &header[..3] != b"ID3" {
                break;
            }
            let size = syncsafe(&header[6..10]) as u64;
            let footer = if header[5] & 0x10 != 0 { 10 } else { 0 };
            let tag_len = (10 + size + footer).min(end - start);
            log::debug!("Skipping {} byte ID3v2.{} tag", tag_len, header[3]);
            start += tag_len;
        }

        if end - start >= ID3V1_LEN {
            reader.seek(SeekFrom::Start(end - ID3V1_LEN))?;
            let mut magic = [0u8; 3];
            reader.read_exact(&mut magic)?;
            if &magic == b"TAG" {
                end -= ID3V1_LEN;
                log::debug!("Skipping trailing ID3v1 tag");
            }
        }

        if end - start >= APE_FOOTER_LEN {
            reader.seek(SeekFrom::Start(end - APE_FOOTER_LEN))?;
            let mut footer = [0u8; APE_FOOTER_LEN as usize];
            reader.read_exact(&mut footer)?;
            if &footer[..8] == b"APETAGEX" {
                let size = le_u32(&footer[12..16]) as u64;
                let flags = le_u32(&footer[20..24]);
                let header = if flags & APE_HAS_HEADER != 0 {
                    APE_FOOTER_LEN
                } else {
                    0
                };
                let total = size + header;
                if size >= APE_FOOTER_LEN && total <= end - start {
                    end -= total;
                    log::debug!("Skipping {} byte APEv2 tag", total);
                }
            }
        }

        if start == 0 && end == len {
            return Ok(false);
        }

        // Only the tag blocks go to lofty, framed as an MP3 so it finds them
        // where that container keeps them
        let mut tags = vec![0u8; start as usize];
        reader.seek(SeekFrom::Start(0))?;
        reader.read_exact(&mut tags)?;
        for _ in 0..2 {
            tags.extend_from_slice(&MPEG_FRAME_HEADER);
            tags.resize(tags.len() + MPEG_FRAME_LEN - MPEG_FRAME_HEADER.len(), 0);
        }
        let trailing_at = tags.len();
        tags.resize(trailing_at + (len - end) as usize, 0);
        reader.seek(SeekFrom::Start(end))?;
        reader.read_exact(&mut tags[trailing_at..])?;
        read_tags(tags, props);

        range.start += start;
        range.len = Some(end - start);
        Ok(true)
    }
}

fn syncsafe(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, b| (acc << 7) | (*b as u32 & 0x7f))
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Fills `props` from every tag lofty finds. Failures only cost metadata.
fn read_tags(tags: Vec<u8>, props: &mut Properties) {
    let options = ParseOptions::new()
        .read_properties(false)
        .parsing_mode(ParsingMode::Relaxed);
    let tagged_file = match Probe::with_file_type(Cursor::new(tags), FileType::Mpeg)
        .options(options)
        .read()
    {
        Ok(file) => file,
        Err(e) => {
            log::warn!("Ignoring unreadable tags: {}", e);
            return;
        }
    };

    // ID3v1 only fills what the richer tags left empty
    let mut tags: Vec<&Tag> = tagged_file.tags().iter().collect();
    tags.sort_by_key(|tag| tag.tag_type() == TagType::Id3v1);
    for tag in tags {
        copy_tag(tag, props);
    }
}

fn copy_tag(tag: &Tag, props: &mut Properties) {
    let mut set = |key: &str, value: Option<String>| {
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            if !props.contains(key) {
                props.set_string(key, value.trim_end_matches('\0'));
            }
        }
    };
    set("title", tag.title().map(|s| s.into_owned()));
    set("artist", tag.artist().map(|s| s.into_owned()));
    set("album", tag.album().map(|s| s.into_owned()));
    set("genre", tag.genre().map(|s| s.into_owned()));
    set("composer", tag.get_string(&ItemKey::Composer).map(str::to_owned));
    set("track", tag.track().map(|n| n.to_string()));
    set("year", tag.year().map(|y| y.to_string()));

    // Free-form items (TXXX descriptions, APE keys) such as LOOPSTART
    for item in tag.items() {
        if let ItemKey::Unknown(key) = item.key() {
            set(key.as_str(), item.value().text().map(str::to_owned));
        }
    }
}
