//! Decoder plugin contract and the built-in decoders.
//!
//! A [`Decoder`] probes encoded content once per [`Audio`](crate::Audio) and
//! returns per-audio state ([`DecoderAudio`]). Every track then opens its own
//! [`TrackDecoder`] cursor from that state, so seek and read positions are
//! never shared. Dropping a track decoder or the audio state releases it.

pub(crate) mod audio_decoder;
pub mod loop_points;
mod raw;
mod sine;
mod symphonia_decoder;

pub use audio_decoder::AudioDecoder;
pub use loop_points::{LoopAction, LoopPoints, LoopTracker};
pub use raw::{RAW_CHANNELS, RAW_SAMPLE_RATE, RawAudio, RawDecoder, samples_to_bytes};
pub use sine::{SINE_AMPLITUDE, SINE_FREQUENCY, SINE_SAMPLE_RATE, SineWaveDecoder};
pub use symphonia_decoder::{IGNORE_LOOP_TAGS, SymphoniaDecoder};

use crate::audio_data::{AudioDuration, ByteRange, ByteSource, ClampedReader};
use crate::config::AudioSpec;
use crate::error::Result;
use crate::properties::Properties;
use crate::stream::AudioStream;
use std::sync::Arc;

/// Property naming the only decoder to try while loading.
pub const DECODER_PROPERTY: &str = "decoder";

/// Frames most decoders push per `decode` call.
pub(crate) const DECODE_CHUNK_FRAMES: usize = 1024;

/// Outcome of one [`TrackDecoder::decode`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeStatus {
    /// Audio was pushed and more may follow
    More,
    EndOfStream,
    /// Unrecoverable failure; treated as end of data by the playback pump
    Error(String),
}

impl DecodeStatus {
    pub fn has_more(&self) -> bool {
        matches!(self, Self::More)
    }
}

/// Content handed to decoders: an optional byte source (synthetic decoders
/// have none) restricted to a byte range.
#[derive(Debug, Clone, Copy)]
pub struct DecoderInput<'a> {
    pub source: Option<&'a ByteSource>,
    pub range: ByteRange,
}

impl<'a> DecoderInput<'a> {
    pub fn new(source: Option<&'a ByteSource>, range: ByteRange) -> Self {
        Self { source, range }
    }

    /// Fresh reader positioned at the start of the range.
    pub fn open(&self) -> Result<Option<ClampedReader>> {
        self.source.map(|s| s.open(self.range)).transpose()
    }

    pub fn extension(&self) -> Option<&'a str> {
        self.source.and_then(|s| s.extension())
    }
}

/// Result of a successful probe.
pub struct ProbedAudio {
    pub spec: AudioSpec,
    pub duration: AudioDuration,
    pub state: Box<dyn DecoderAudio>,
}

impl std::fmt::Debug for ProbedAudio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbedAudio")
            .field("spec", &self.spec)
            .field("duration", &self.duration)
            .finish_non_exhaustive()
    }
}

pub trait Decoder: Send + Sync {
    /// Upper-case identifier, matched against the `decoder` load property.
    fn name(&self) -> &'static str;

    /// Process-wide setup; decoders returning `false` are left out of the
    /// available list.
    fn init(&self) -> bool {
        true
    }

    fn quit(&self) {}

    /// Checks whether `input` is in this decoder's format. `Ok(None)` means
    /// "not mine" and lets the next decoder try.
    fn probe(&self, input: &DecoderInput<'_>, props: &mut Properties)
    -> Result<Option<ProbedAudio>>;
}

/// Per-audio decoder state, shared read-only by every track.
pub trait DecoderAudio: Send + Sync {
    fn open_track(&self, input: &DecoderInput<'_>) -> Result<Box<dyn TrackDecoder>>;
}

/// One track's decode cursor.
pub trait TrackDecoder: Send {
    /// Pushes roughly one internal buffer of audio into `out`, whose input
    /// format is the audio's spec.
    fn decode(&mut self, out: &mut AudioStream) -> DecodeStatus;

    /// Repositions to an absolute frame. Must work after end of stream.
    fn seek(&mut self, frame: u64) -> Result<()>;
}

/// Built-in decoders in probe order.
pub fn builtin_decoders() -> Vec<Arc<dyn Decoder>> {
    vec![
        Arc::new(RawDecoder),
        Arc::new(SymphoniaDecoder),
        Arc::new(SineWaveDecoder),
    ]
}
