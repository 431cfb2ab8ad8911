//! Uncompressed little-endian `f32` PCM with an externally supplied spec.
//!
//! Also the decoder every predecoded audio is switched to.

use super::{
    DECODE_CHUNK_FRAMES, DecodeStatus, Decoder, DecoderAudio, DecoderInput, ProbedAudio,
    TrackDecoder,
};
use crate::audio_data::{AudioDuration, ClampedReader};
use crate::config::AudioSpec;
use crate::error::{PetalMixError, Result};
use crate::properties::Properties;
use crate::stream::AudioStream;
use std::io::{ErrorKind, Read, Seek, SeekFrom};

pub const RAW_SAMPLE_RATE: &str = "raw.sample_rate";
pub const RAW_CHANNELS: &str = "raw.channels";

const SAMPLE_BYTES: usize = std::mem::size_of::<f32>();

/// Encodes samples the way [`RawDecoder`] reads them.
pub fn samples_to_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    fn name(&self) -> &'static str {
        "RAW"
    }

    fn probe(
        &self,
        input: &DecoderInput<'_>,
        props: &mut Properties,
    ) -> Result<Option<ProbedAudio>> {
        let (Some(rate), Some(channels)) = (props.number(RAW_SAMPLE_RATE), props.number(RAW_CHANNELS))
        else {
            return Ok(None);
        };
        let Some(mut reader) = input.open()? else {
            return Ok(None);
        };

        let spec = AudioSpec::new(
            u32::try_from(rate).map_err(|_| PetalMixError::invalid("Bad raw sample rate"))?,
            u16::try_from(channels).map_err(|_| PetalMixError::invalid("Bad raw channel count"))?,
        );
        spec.validate()?;

        let frame_bytes = (spec.frame_len() * SAMPLE_BYTES) as u64;
        let frames = reader.seek(SeekFrom::End(0))? / frame_bytes;
        log::debug!("RAW audio: {}, {} frames", spec, frames);

        Ok(Some(ProbedAudio {
            spec,
            duration: AudioDuration::Known(frames),
            state: Box::new(RawAudio::new(spec)),
        }))
    }
}

/// Per-audio state: nothing but the layout.
#[derive(Debug, Clone, Copy)]
pub struct RawAudio {
    spec: AudioSpec,
}

impl RawAudio {
    pub fn new(spec: AudioSpec) -> Self {
        Self { spec }
    }
}

impl DecoderAudio for RawAudio {
    fn open_track(&self, input: &DecoderInput<'_>) -> Result<Box<dyn TrackDecoder>> {
        let reader = input
            .open()?
            .ok_or_else(|| PetalMixError::Decoder("RAW audio needs a byte source".into()))?;
        let frame_bytes = self.spec.frame_len() * SAMPLE_BYTES;
        Ok(Box::new(RawTrack {
            reader,
            frame_bytes,
            bytes: vec![0; DECODE_CHUNK_FRAMES * frame_bytes],
            samples: Vec::with_capacity(DECODE_CHUNK_FRAMES * self.spec.frame_len()),
        }))
    }
}

struct RawTrack {
    reader: ClampedReader,
    frame_bytes: usize,
    bytes: Vec<u8>,
    samples: Vec<f32>,
}

impl RawTrack {
    /// Fills as much of the byte buffer as the reader allows.
    fn fill(&mut self) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < self.bytes.len() {
            match self.reader.read(&mut self.bytes[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl TrackDecoder for RawTrack {
    fn decode(&mut self, out: &mut AudioStream) -> DecodeStatus {
        let filled = match self.fill() {
            Ok(n) => n,
            Err(e) => return DecodeStatus::Error(e.to_string()),
        };
        // Drop a trailing partial frame
        let usable = filled - filled % self.frame_bytes;
        if usable == 0 {
            return DecodeStatus::EndOfStream;
        }

        self.samples.clear();
        self.samples.extend(
            self.bytes[..usable]
                .chunks_exact(SAMPLE_BYTES)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );
        match out.put(&self.samples) {
            Ok(()) => DecodeStatus::More,
            Err(e) => DecodeStatus::Error(e.to_string()),
        }
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        self.reader
            .seek(SeekFrom::Start(frame * self.frame_bytes as u64))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_data::{ByteRange, ByteSource};

    fn raw_props(rate: i64, channels: i64) -> Properties {
        let mut props = Properties::new();
        props.set_number(RAW_SAMPLE_RATE, rate);
        props.set_number(RAW_CHANNELS, channels);
        props
    }

    #[test]
    fn test_probe_requires_properties() {
        let source = ByteSource::from_bytes(samples_to_bytes(&[0.0; 8]));
        let input = DecoderInput::new(Some(&source), ByteRange::FULL);
        assert!(
            RawDecoder
                .probe(&input, &mut Properties::new())
                .unwrap()
                .is_none()
        );

        let probed = RawDecoder
            .probe(&input, &mut raw_props(8000, 2))
            .unwrap()
            .unwrap();
        assert_eq!(probed.spec, AudioSpec::new(8000, 2));
        assert_eq!(probed.duration, AudioDuration::Known(4));

        assert!(RawDecoder.probe(&input, &mut raw_props(0, 2)).is_err());
    }

    #[test]
    fn test_decode_and_seek() {
        let samples: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let source = ByteSource::from_bytes(samples_to_bytes(&samples));
        let input = DecoderInput::new(Some(&source), ByteRange::FULL);
        let spec = AudioSpec::new(8000, 1);
        let mut track = RawAudio::new(spec).open_track(&input).unwrap();
        let mut out = AudioStream::passthrough(spec).unwrap();

        assert_eq!(track.decode(&mut out), DecodeStatus::More);
        assert_eq!(track.decode(&mut out), DecodeStatus::EndOfStream);
        assert_eq!(out.available_frames(), 10);

        out.clear();
        track.seek(7).unwrap();
        assert_eq!(track.decode(&mut out), DecodeStatus::More);
        let mut pulled = [0.0; 3];
        out.get(&mut pulled);
        assert_eq!(pulled, [7.0, 8.0, 9.0]);
    }
}
