pub mod audio_data;
pub mod config;
pub mod context;
pub mod decoder;
mod engine;
pub mod error;
pub mod events;
pub mod group;
pub mod math;
pub mod mixer;
pub mod playback;
pub mod properties;
pub mod spatial;
pub mod stream;
pub mod track;

pub use audio_data::{Audio, AudioDuration, AudioId, Id3TagParser, LoadOptions, TagParser};
pub use config::{AudioSpec, MixerDesc};
pub use context::{Context, LiveCounts};
pub use decoder::{AudioDecoder, DecodeStatus, Decoder, DecoderAudio, TrackDecoder};
pub use error::{PetalMixError, Result};
pub use events::MixerEvent;
pub use group::{Group, GroupCallback, GroupId};
pub use math::Vec3;
pub use mixer::{Mixer, PostmixCallback};
pub use playback::{FrameOrMs, PlayOptions, PlayState};
pub use properties::{Properties, PropertyValue};
pub use spatial::Spatialization;
pub use stream::{AudioStream, PcmStream, ResamplerType};
pub use track::{StoppedCallback, Track, TrackCallback, TrackId};

use std::sync::OnceLock;

/// The process-wide context behind [`init`] and [`quit`].
pub fn context() -> &'static Context {
    static CONTEXT: OnceLock<Context> = OnceLock::new();
    CONTEXT.get_or_init(Context::new)
}

/// Initializes the process-wide context. Nested calls are cheap; a single
/// [`quit`] undoes all of them.
pub fn init() -> Result<()> {
    context().init()
}

/// Destroys every live mixer, audio and standalone decoder of the
/// process-wide context and reports how many there were.
pub fn quit() -> LiveCounts {
    context().quit()
}
