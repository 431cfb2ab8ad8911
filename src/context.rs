//! Process-wide registry: init/quit refcount, the decoder table and weak
//! lists of every live mixer, audio and standalone decoder.
//!
//! Lock order is registry, then mixer, then track. The registry lock is only
//! held to insert, remove or snapshot entries; teardown runs after it is
//! released.

use crate::audio_data::{
    Audio, AudioInner, ByteSource, Id3TagParser, LoadOptions, TagParser, loader,
};
use crate::config::AudioSpec;
use crate::decoder::{
    AudioDecoder, DECODER_PROPERTY, Decoder, RAW_CHANNELS, RAW_SAMPLE_RATE, SINE_AMPLITUDE,
    SINE_FREQUENCY, builtin_decoders, samples_to_bytes,
};
use crate::decoder::audio_decoder::AudioDecoderShared;
use crate::error::{PetalMixError, Result};
use crate::mixer::{Mixer, MixerShared};
use crate::properties::PropertyValue;
use crate::spatial::VectorBackend;
use parking_lot::Mutex;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Weak};

/// Decoders and tag parsers handed to one load call.
pub(crate) type Plugins = (Vec<Arc<dyn Decoder>>, Vec<Arc<dyn TagParser>>);

/// Objects still alive in a context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveCounts {
    pub mixers: usize,
    pub audios: usize,
    pub audio_decoders: usize,
}

impl LiveCounts {
    pub fn total(&self) -> usize {
        self.mixers + self.audios + self.audio_decoders
    }
}

struct Registry {
    refcount: u32,
    vector_backend: VectorBackend,
    decoders: Vec<Arc<dyn Decoder>>,
    available: Vec<Arc<dyn Decoder>>,
    tag_parsers: Vec<Arc<dyn TagParser>>,
    mixers: Vec<Weak<MixerShared>>,
    audios: Vec<Weak<AudioInner>>,
    audio_decoders: Vec<Weak<AudioDecoderShared>>,
}

impl Registry {
    fn prune(&mut self) {
        self.mixers.retain(|m| m.strong_count() > 0);
        self.audios.retain(|a| a.strong_count() > 0);
        self.audio_decoders.retain(|d| d.strong_count() > 0);
    }
}

/// Handle to a registry. Clones share it.
///
/// Most applications use the process-wide instance behind
/// [`crate::init`]/[`crate::quit`]; tests create their own.
#[derive(Clone)]
pub struct Context {
    registry: Arc<Mutex<Registry>>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("Context")
            .field("refcount", &registry.refcount)
            .field("decoders", &registry.decoders.len())
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                refcount: 0,
                vector_backend: VectorBackend::Scalar,
                decoders: builtin_decoders(),
                available: Vec::new(),
                tag_parsers: vec![Arc::new(Id3TagParser)],
                mixers: Vec::new(),
                audios: Vec::new(),
                audio_decoders: Vec::new(),
            })),
        }
    }

    /// Initializes on the first call; nested calls only bump the refcount.
    pub fn init(&self) -> Result<()> {
        let mut registry = self.registry.lock();
        if registry.refcount == 0 {
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            if !std::arch::is_x86_feature_detected!("sse2") {
                return Err(PetalMixError::Unsupported(
                    "SSE2 is required on this platform".into(),
                ));
            }

            registry.available = registry
                .decoders
                .iter()
                .filter(|d| {
                    let ok = d.init();
                    if !ok {
                        log::warn!("Decoder {} failed to initialize", d.name());
                    }
                    ok
                })
                .cloned()
                .collect();
            registry.vector_backend = VectorBackend::detect();
            log::info!(
                "petalmix initialized: decoders [{}], vector backend {:?}",
                registry
                    .available
                    .iter()
                    .map(|d| d.name())
                    .collect::<Vec<_>>()
                    .join(", "),
                registry.vector_backend
            );
        }
        registry.refcount += 1;
        Ok(())
    }

    /// Tears everything down, however many times `init` was called.
    ///
    /// Standalone decoders go first, then mixers (which releases their
    /// tracks' audio bindings), then the remaining audios. Returns what was
    /// actually destroyed.
    pub fn quit(&self) -> LiveCounts {
        let (decoders, mixers, audios, available) = {
            let mut registry = self.registry.lock();
            if registry.refcount == 0 {
                log::warn!("quit called on an uninitialized context");
                return LiveCounts::default();
            }
            registry.refcount = 0;
            (
                std::mem::take(&mut registry.audio_decoders),
                std::mem::take(&mut registry.mixers),
                std::mem::take(&mut registry.audios),
                std::mem::take(&mut registry.available),
            )
        };

        let mut destroyed = LiveCounts::default();
        for decoder in decoders.iter().filter_map(Weak::upgrade) {
            if decoder.destroy() {
                destroyed.audio_decoders += 1;
            }
        }
        for mixer in mixers.iter().filter_map(Weak::upgrade) {
            if Mixer::from_shared(mixer).destroy() {
                destroyed.mixers += 1;
            }
        }
        for audio in audios.iter().filter_map(Weak::upgrade) {
            if audio.destroy() {
                destroyed.audios += 1;
            }
        }
        for decoder in &available {
            decoder.quit();
        }

        log::info!(
            "petalmix shut down: {} decoders, {} mixers, {} audios destroyed",
            destroyed.audio_decoders,
            destroyed.mixers,
            destroyed.audios
        );
        destroyed
    }

    pub fn is_initialized(&self) -> bool {
        self.registry.lock().refcount > 0
    }

    pub(crate) fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(PetalMixError::NotInitialized)
        }
    }

    pub fn live_counts(&self) -> LiveCounts {
        let mut registry = self.registry.lock();
        registry.prune();
        LiveCounts {
            mixers: registry
                .mixers
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|m| !m.is_destroyed())
                .count(),
            audios: registry
                .audios
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|a| !a.is_destroyed())
                .count(),
            audio_decoders: registry
                .audio_decoders
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|d| !d.is_destroyed())
                .count(),
        }
    }

    /// Registers an extra decoder, probed after the built-in ones. If the
    /// context is already initialized the decoder's `init` runs now.
    pub fn add_decoder(&self, decoder: Arc<dyn Decoder>) -> Result<()> {
        let mut registry = self.registry.lock();
        if registry
            .decoders
            .iter()
            .any(|d| d.name().eq_ignore_ascii_case(decoder.name()))
        {
            return Err(PetalMixError::invalid(format!(
                "Decoder {} is already registered",
                decoder.name()
            )));
        }
        if registry.refcount > 0 {
            if decoder.init() {
                registry.available.push(decoder.clone());
            } else {
                log::warn!("Decoder {} failed to initialize", decoder.name());
            }
        }
        log::debug!("Registered decoder {}", decoder.name());
        registry.decoders.push(decoder);
        Ok(())
    }

    /// Names of decoders that initialized successfully, in probe order.
    pub fn available_decoders(&self) -> Vec<&'static str> {
        self.registry
            .lock()
            .available
            .iter()
            .map(|d| d.name())
            .collect()
    }

    pub fn vector_backend(&self) -> VectorBackend {
        self.registry.lock().vector_backend
    }

    pub(crate) fn load_plugins(&self) -> Result<Plugins> {
        let registry = self.registry.lock();
        if registry.refcount == 0 {
            return Err(PetalMixError::NotInitialized);
        }
        Ok((registry.available.clone(), registry.tag_parsers.clone()))
    }

    pub(crate) fn register_audio(&self, audio: &Audio) {
        let mut registry = self.registry.lock();
        registry.prune();
        registry.audios.push(audio.downgrade());
    }

    pub(crate) fn register_mixer(&self, mixer: &Arc<MixerShared>) {
        let mut registry = self.registry.lock();
        registry.prune();
        registry.mixers.push(Arc::downgrade(mixer));
    }

    pub(crate) fn register_audio_decoder(&self, decoder: &AudioDecoder) {
        let mut registry = self.registry.lock();
        registry.prune();
        registry.audio_decoders.push(decoder.downgrade());
    }

    /// Loads a file. Encoded bytes are copied into memory unless
    /// `options.ondemand` is set.
    pub fn load_audio(&self, path: impl AsRef<Path>, options: &LoadOptions) -> Result<Audio> {
        loader::load(self, Some(ByteSource::from_path(path)), options, true)
    }

    /// Reads `reader` to the end and loads the bytes.
    pub fn load_audio_from_reader(
        &self,
        mut reader: impl Read,
        options: &LoadOptions,
    ) -> Result<Audio> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        self.load_audio_from_memory(bytes, options)
    }

    pub fn load_audio_from_memory(
        &self,
        bytes: impl Into<Arc<[u8]>>,
        options: &LoadOptions,
    ) -> Result<Audio> {
        loader::load(self, Some(ByteSource::from_bytes(bytes)), options, true)
    }

    /// Wraps interleaved PCM in `spec` as an audio.
    pub fn load_raw_audio(&self, samples: &[f32], spec: AudioSpec) -> Result<Audio> {
        spec.validate()?;
        if samples.len() % spec.frame_len() != 0 {
            return Err(PetalMixError::invalid(format!(
                "Sample count {} is not a multiple of {} channels",
                samples.len(),
                spec.channels
            )));
        }
        let options = LoadOptions::new()
            .skip_tags(true)
            .property(DECODER_PROPERTY, PropertyValue::String("RAW".into()))
            .property(RAW_SAMPLE_RATE, PropertyValue::Number(spec.sample_rate.into()))
            .property(RAW_CHANNELS, PropertyValue::Number(spec.channels.into()));
        self.load_audio_from_memory(samples_to_bytes(samples), &options)
    }

    /// Endless mono sine tone.
    pub fn create_sine_wave_audio(&self, frequency: f32, amplitude: f32) -> Result<Audio> {
        let options = LoadOptions::new()
            .decoder("SINEWAVE")
            .property(SINE_FREQUENCY, PropertyValue::Float(frequency.into()))
            .property(SINE_AMPLITUDE, PropertyValue::Float(amplitude.into()));
        loader::load(self, None, &options, true)
    }
}
