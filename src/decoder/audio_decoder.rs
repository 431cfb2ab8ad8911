use super::{DecodeStatus, TrackDecoder};
use crate::audio_data::{Audio, ByteSource, LoadOptions, loader};
use crate::config::AudioSpec;
use crate::context::Context;
use crate::error::{PetalMixError, Result};
use crate::properties::Properties;
use crate::stream::AudioStream;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::{Arc, Weak};

struct Cursor {
    track: Box<dyn TrackDecoder>,
    stream: AudioStream,
    finished: bool,
}

pub(crate) struct AudioDecoderShared {
    audio: Audio,
    cursor: Mutex<Option<Cursor>>,
}

impl AudioDecoderShared {
    pub(crate) fn destroy(&self) -> bool {
        self.cursor.lock().take().is_some()
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.cursor.lock().is_none()
    }
}

/// Decode-only handle: pulls PCM out of content without a mixer, converted
/// to whatever spec the caller asks for.
#[derive(Clone)]
pub struct AudioDecoder {
    shared: Arc<AudioDecoderShared>,
}

impl AudioDecoder {
    pub fn open_path(ctx: &Context, path: impl AsRef<Path>, options: &LoadOptions) -> Result<Self> {
        Self::open(ctx, ByteSource::from_path(path), options)
    }

    pub fn open_memory(ctx: &Context, bytes: impl Into<Arc<[u8]>>, options: &LoadOptions) -> Result<Self> {
        Self::open(ctx, ByteSource::from_bytes(bytes), options)
    }

    fn open(ctx: &Context, source: ByteSource, options: &LoadOptions) -> Result<Self> {
        // Streams straight from the source; predecoding would only double the work
        let options = options.clone().predecode(false).ondemand(true);
        let audio = loader::load(ctx, Some(source), &options, false)?;
        let track = audio.open_track()?;
        let stream = AudioStream::passthrough(audio.spec())?;

        let decoder = Self {
            shared: Arc::new(AudioDecoderShared {
                audio,
                cursor: Mutex::new(Some(Cursor {
                    track,
                    stream,
                    finished: false,
                })),
            }),
        };
        ctx.register_audio_decoder(&decoder);
        Ok(decoder)
    }

    /// Native layout of the content.
    pub fn spec(&self) -> AudioSpec {
        self.shared.audio.spec()
    }

    pub fn properties(&self) -> &Properties {
        self.shared.audio.properties()
    }

    pub fn audio(&self) -> &Audio {
        &self.shared.audio
    }

    /// Fills `out` with interleaved samples in `spec`. Returns the number of
    /// samples written; `0` means the content is exhausted.
    pub fn decode(&self, out: &mut [f32], spec: AudioSpec) -> Result<usize> {
        let mut cursor = self.shared.cursor.lock();
        let cursor = cursor.as_mut().ok_or(PetalMixError::Destroyed("AudioDecoder"))?;
        cursor.stream.set_format(self.shared.audio.spec(), spec)?;

        let wanted = out.len() - out.len() % spec.frame_len();
        let mut written = 0;
        while written < wanted {
            let available = cursor.stream.available_frames() * spec.frame_len();
            if available >= wanted - written || (cursor.finished && available > 0) {
                written += cursor.stream.get(&mut out[written..wanted]);
                continue;
            }
            if cursor.finished {
                break;
            }
            match cursor.track.decode(&mut cursor.stream) {
                DecodeStatus::More => {}
                DecodeStatus::EndOfStream => {
                    cursor.finished = true;
                    cursor.stream.flush();
                }
                DecodeStatus::Error(e) => {
                    cursor.finished = true;
                    cursor.stream.flush();
                    return Err(PetalMixError::Decoder(e));
                }
            }
        }
        Ok(written)
    }

    /// Moves to an absolute frame in the content's own rate.
    pub fn seek(&self, frame: u64) -> Result<()> {
        if let Some(total) = self.shared.audio.duration().frames() {
            if frame > total {
                return Err(PetalMixError::invalid(format!(
                    "Frame {} past the end ({} frames)",
                    frame, total
                )));
            }
        }
        let mut cursor = self.shared.cursor.lock();
        let cursor = cursor.as_mut().ok_or(PetalMixError::Destroyed("AudioDecoder"))?;
        cursor.track.seek(frame)?;
        cursor.stream.clear();
        cursor.finished = false;
        Ok(())
    }

    pub fn destroy(&self) {
        if self.shared.destroy() {
            log::debug!("AudioDecoder for {} destroyed", self.shared.audio.id());
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }

    pub(crate) fn downgrade(&self) -> Weak<AudioDecoderShared> {
        Arc::downgrade(&self.shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{RAW_CHANNELS, RAW_SAMPLE_RATE, samples_to_bytes};
    use crate::properties::PropertyValue;

    fn raw_options(rate: i64, channels: i64) -> LoadOptions {
        LoadOptions::new()
            .property(RAW_SAMPLE_RATE, PropertyValue::Number(rate))
            .property(RAW_CHANNELS, PropertyValue::Number(channels))
    }

    #[test]
    fn test_decode_converts_channels() {
        let ctx = Context::new();
        ctx.init().unwrap();

        let bytes = samples_to_bytes(&[0.25, 0.5, 0.75]);
        let decoder = AudioDecoder::open_memory(&ctx, bytes, &raw_options(8000, 1)).unwrap();
        assert_eq!(decoder.spec(), AudioSpec::new(8000, 1));

        let mut out = [0.0; 8];
        let written = decoder.decode(&mut out, AudioSpec::new(8000, 2)).unwrap();
        assert_eq!(written, 6);
        assert_eq!(&out[..6], &[0.25, 0.25, 0.5, 0.5, 0.75, 0.75]);
        assert_eq!(decoder.decode(&mut out, AudioSpec::new(8000, 2)).unwrap(), 0);

        decoder.seek(2).unwrap();
        assert_eq!(decoder.decode(&mut out, AudioSpec::new(8000, 1)).unwrap(), 1);
        assert_eq!(out[0], 0.75);
        assert!(decoder.seek(10).is_err());

        ctx.quit();
    }

    #[test]
    fn test_destroyed_decoder_errors() {
        let ctx = Context::new();
        ctx.init().unwrap();
        let bytes = samples_to_bytes(&[0.0; 4]);
        let decoder = AudioDecoder::open_memory(&ctx, bytes, &raw_options(8000, 1)).unwrap();
        decoder.destroy();
        assert!(decoder.is_destroyed());
        let mut out = [0.0; 4];
        assert!(decoder.decode(&mut out, AudioSpec::new(8000, 1)).is_err());
        ctx.quit();
    }
}
