//! Seekable byte sources with an optional range clamp.

use crate::error::{PetalMixError, Result};
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use symphonia::core::io::MediaSource;

/// Where encoded bytes come from. Every reader opened from a source is an
/// independent cursor, so tracks never share read positions.
#[derive(Debug, Clone)]
pub enum ByteSource {
    Memory(Arc<[u8]>),
    File(PathBuf),
}

impl ByteSource {
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self::File(path.as_ref().to_path_buf())
    }

    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::Memory(bytes.into())
    }

    /// File extension, used as a format hint.
    pub fn extension(&self) -> Option<&str> {
        match self {
            Self::File(path) => path.extension().and_then(|e| e.to_str()),
            Self::Memory(_) => None,
        }
    }

    pub fn total_len(&self) -> Result<u64> {
        match self {
            Self::Memory(bytes) => Ok(bytes.len() as u64),
            Self::File(path) => Ok(std::fs::metadata(path)?.len()),
        }
    }

    pub fn open(&self, range: ByteRange) -> Result<ClampedReader> {
        let (inner, total): (Box<dyn ReadSeek>, u64) = match self {
            Self::Memory(bytes) => (Box::new(Cursor::new(bytes.clone())), bytes.len() as u64),
            Self::File(path) => {
                let file = File::open(path).map_err(|e| {
                    log::warn!("Failed to open {}: {}", path.display(), e);
                    PetalMixError::Io(e)
                })?;
                let len = file.metadata()?.len();
                (Box::new(file), len)
            }
        };
        ClampedReader::new(inner, total, range)
    }

    /// Reads the clamped range fully into memory.
    pub fn slurp(&self, range: ByteRange) -> Result<Arc<[u8]>> {
        let mut reader = self.open(range)?;
        let mut bytes = Vec::with_capacity(reader.len() as usize);
        reader.read_to_end(&mut bytes)?;
        Ok(bytes.into())
    }
}

/// Sub-range of a source visible to decoders. `len == None` runs to the end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub len: Option<u64>,
}

impl ByteRange {
    pub const FULL: Self = Self {
        start: 0,
        len: None,
    };

    pub fn new(start: u64, len: u64) -> Self {
        Self {
            start,
            len: Some(len),
        }
    }

    fn resolve(&self, total: u64) -> (u64, u64) {
        let start = self.start.min(total);
        let end = match self.len {
            Some(len) => start.saturating_add(len).min(total),
            None => total,
        };
        (start, end)
    }
}

trait ReadSeek: Read + Seek + Send + Sync {}
impl<T: Read + Seek + Send + Sync> ReadSeek for T {}

/// Reader restricted to `[start, end)` of the underlying stream.
pub struct ClampedReader {
    inner: Box<dyn ReadSeek>,
    start: u64,
    end: u64,
    pos: u64,
}

impl ClampedReader {
    fn new(mut inner: Box<dyn ReadSeek>, total: u64, range: ByteRange) -> Result<Self> {
        let (start, end) = range.resolve(total);
        inner.seek(SeekFrom::Start(start))?;
        Ok(Self {
            inner,
            start,
            end,
            pos: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Read for ClampedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len().saturating_sub(self.pos);
        let max = (buf.len() as u64).min(remaining) as usize;
        if max == 0 {
            return Ok(0);
        }
        let n = self.inner.read(&mut buf[..max])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for ClampedReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.pos as i128 + delta as i128,
            SeekFrom::End(delta) => self.len() as i128 + delta as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of range",
            ));
        }
        // Seeking past the end is allowed; reads there return 0 bytes
        let target = target as u64;
        self.inner.seek(SeekFrom::Start(self.start + target))?;
        self.pos = target;
        Ok(target)
    }
}

impl MediaSource for ClampedReader {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        Some(self.len())
    }
}
