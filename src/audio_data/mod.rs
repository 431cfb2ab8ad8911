//! Audio data and loading functionality

mod load_options;
pub(crate) mod loader;
mod source;
mod tags;

pub use load_options::LoadOptions;
pub use source::{ByteRange, ByteSource, ClampedReader};
pub use tags::{Id3TagParser, TagParser};

use crate::config::AudioSpec;
use crate::decoder::{DecoderAudio, DecoderInput, TrackDecoder};
use crate::error::{PetalMixError, Result};
use crate::properties::Properties;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Length of loaded content in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioDuration {
    Known(u64),
    Unknown,
    Infinite,
}

impl AudioDuration {
    pub fn frames(&self) -> Option<u64> {
        match self {
            Self::Known(frames) => Some(*frames),
            _ => None,
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Self::Infinite)
    }
}

/// Unique identifier for a loaded audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AudioId(u64);

impl AudioId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for AudioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Audio({})", self.0)
    }
}

/// Everything a track needs to open its own decode cursor. Released once,
/// either when the last handle drops or when the context quits.
struct AudioPayload {
    state: Box<dyn DecoderAudio>,
    source: Option<ByteSource>,
    range: ByteRange,
}

pub(crate) struct AudioInner {
    id: AudioId,
    spec: AudioSpec,
    duration: AudioDuration,
    decoder_name: &'static str,
    properties: Properties,
    payload: RwLock<Option<AudioPayload>>,
}

impl AudioInner {
    /// Releases the decoder state. Returns `false` if already released.
    pub(crate) fn destroy(&self) -> bool {
        let released = self.payload.write().take().is_some();
        if released {
            log::debug!("{} destroyed", self.id);
        }
        released
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.payload.read().is_none()
    }
}

/// Loaded (or loadable on demand) content, shared by every track bound to it.
///
/// Clones share the same content; the strong count is the reference count
/// and the decoder state is released with the last clone.
#[derive(Clone)]
pub struct Audio {
    inner: Arc<AudioInner>,
}

impl std::fmt::Debug for Audio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Audio")
            .field("id", &self.inner.id)
            .field("spec", &self.inner.spec)
            .field("duration", &self.inner.duration)
            .field("decoder", &self.inner.decoder_name)
            .finish()
    }
}

impl PartialEq for Audio {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Audio {
    pub(crate) fn new(
        spec: AudioSpec,
        duration: AudioDuration,
        decoder_name: &'static str,
        properties: Properties,
        state: Box<dyn DecoderAudio>,
        source: Option<ByteSource>,
        range: ByteRange,
    ) -> Self {
        Self {
            inner: Arc::new(AudioInner {
                id: AudioId::next(),
                spec,
                duration,
                decoder_name,
                properties,
                payload: RwLock::new(Some(AudioPayload {
                    state,
                    source,
                    range,
                })),
            }),
        }
    }

    pub fn id(&self) -> AudioId {
        self.inner.id
    }

    pub fn spec(&self) -> AudioSpec {
        self.inner.spec
    }

    pub fn duration(&self) -> AudioDuration {
        self.inner.duration
    }

    /// Name of the decoder that accepted the content (`"RAW"` after predecode).
    pub fn decoder_name(&self) -> &'static str {
        self.inner.decoder_name
    }

    pub fn properties(&self) -> &Properties {
        &self.inner.properties
    }

    /// Number of live handles, including track bindings.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    pub fn ms_to_frames(&self, ms: u64) -> u64 {
        self.inner.spec.ms_to_frames(ms)
    }

    pub fn frames_to_ms(&self, frames: u64) -> u64 {
        self.inner.spec.frames_to_ms(frames)
    }

    /// Whether the bytes live in memory (predecoded or copied at load).
    pub fn is_in_memory(&self) -> bool {
        matches!(
            self.inner.payload.read().as_ref().and_then(|p| p.source.as_ref()),
            Some(ByteSource::Memory(_))
        )
    }

    /// Opens a private decode cursor for one track.
    pub(crate) fn open_track(&self) -> Result<Box<dyn TrackDecoder>> {
        let payload = self.inner.payload.read();
        let payload = payload.as_ref().ok_or(PetalMixError::Destroyed("Audio"))?;
        let input = DecoderInput::new(payload.source.as_ref(), payload.range);
        payload.state.open_track(&input)
    }

    pub(crate) fn downgrade(&self) -> Weak<AudioInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn destroy(&self) -> bool {
        self.inner.destroy()
    }
}
