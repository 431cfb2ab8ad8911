//! Synthetic sine wave generator. Never ends on its own.

use super::{
    DECODE_CHUNK_FRAMES, DecodeStatus, Decoder, DecoderAudio, DecoderInput, ProbedAudio,
    TrackDecoder,
};
use crate::audio_data::AudioDuration;
use crate::config::AudioSpec;
use crate::error::{PetalMixError, Result};
use crate::properties::Properties;
use crate::stream::AudioStream;
use std::f64::consts::TAU;

pub const SINE_FREQUENCY: &str = "sine.frequency";
pub const SINE_AMPLITUDE: &str = "sine.amplitude";
pub const SINE_SAMPLE_RATE: &str = "sine.sample_rate";

const DEFAULT_SAMPLE_RATE: u32 = 48000;

#[derive(Debug, Default, Clone, Copy)]
pub struct SineWaveDecoder;

impl Decoder for SineWaveDecoder {
    fn name(&self) -> &'static str {
        "SINEWAVE"
    }

    fn probe(
        &self,
        input: &DecoderInput<'_>,
        props: &mut Properties,
    ) -> Result<Option<ProbedAudio>> {
        if input.source.is_some() {
            return Ok(None);
        }
        let Some(frequency) = props.float(SINE_FREQUENCY) else {
            return Ok(None);
        };
        let amplitude = props.float(SINE_AMPLITUDE).unwrap_or(1.0);
        if !(frequency > 0.0) || !(0.0..=1.0).contains(&amplitude) {
            return Err(PetalMixError::invalid(format!(
                "Sine wave needs frequency > 0 and amplitude in 0..=1 (got {} Hz, {})",
                frequency, amplitude
            )));
        }
        let rate = props
            .number(SINE_SAMPLE_RATE)
            .and_then(|r| u32::try_from(r).ok())
            .unwrap_or(DEFAULT_SAMPLE_RATE);
        let spec = AudioSpec::new(rate, 1);
        spec.validate()?;

        Ok(Some(ProbedAudio {
            spec,
            duration: AudioDuration::Infinite,
            state: Box::new(SineAudio {
                frequency,
                amplitude: amplitude as f32,
                sample_rate: rate,
            }),
        }))
    }
}

struct SineAudio {
    frequency: f64,
    amplitude: f32,
    sample_rate: u32,
}

impl DecoderAudio for SineAudio {
    fn open_track(&self, _input: &DecoderInput<'_>) -> Result<Box<dyn TrackDecoder>> {
        Ok(Box::new(SineTrack {
            step: TAU * self.frequency / self.sample_rate as f64,
            amplitude: self.amplitude,
            frame: 0,
            period: (self.sample_rate as f64 / self.frequency).round().max(1.0) as u64,
            buffer: vec![0.0; DECODE_CHUNK_FRAMES],
        }))
    }
}

struct SineTrack {
    step: f64,
    amplitude: f32,
    frame: u64,
    period: u64,
    buffer: Vec<f32>,
}

impl TrackDecoder for SineTrack {
    fn decode(&mut self, out: &mut AudioStream) -> DecodeStatus {
        for sample in self.buffer.iter_mut() {
            *sample = (self.frame as f64 * self.step).sin() as f32 * self.amplitude;
            self.frame += 1;
        }
        // Keep the phase argument small; exact for integer periods
        if self.frame > self.period * 1024 {
            self.frame %= self.period;
        }
        match out.put(&self.buffer) {
            Ok(()) => DecodeStatus::More,
            Err(e) => DecodeStatus::Error(e.to_string()),
        }
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        self.frame = frame;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_data::{ByteRange, ByteSource};

    fn sine_props(frequency: f64) -> Properties {
        let mut props = Properties::new();
        props.set_float(SINE_FREQUENCY, frequency);
        props.set_float(SINE_AMPLITUDE, 0.5);
        props
    }

    #[test]
    fn test_only_matches_without_source() {
        let source = ByteSource::from_bytes(vec![0u8; 4]);
        let with_source = DecoderInput::new(Some(&source), ByteRange::FULL);
        assert!(
            SineWaveDecoder
                .probe(&with_source, &mut sine_props(440.0))
                .unwrap()
                .is_none()
        );

        let none = DecoderInput::new(None, ByteRange::FULL);
        assert!(
            SineWaveDecoder
                .probe(&none, &mut Properties::new())
                .unwrap()
                .is_none()
        );
        assert!(SineWaveDecoder.probe(&none, &mut sine_props(-1.0)).is_err());
    }

    #[test]
    fn test_generates_bounded_signal() {
        let none = DecoderInput::new(None, ByteRange::FULL);
        let probed = SineWaveDecoder
            .probe(&none, &mut sine_props(1000.0))
            .unwrap()
            .unwrap();
        assert_eq!(probed.duration, AudioDuration::Infinite);

        let mut track = probed.state.open_track(&none).unwrap();
        let mut out = AudioStream::passthrough(probed.spec).unwrap();
        assert_eq!(track.decode(&mut out), DecodeStatus::More);

        let mut samples = vec![0.0; DECODE_CHUNK_FRAMES];
        assert_eq!(out.get(&mut samples), DECODE_CHUNK_FRAMES);
        assert_eq!(samples[0], 0.0);
        assert!(samples.iter().all(|s| s.abs() <= 0.5));
        // 48 samples per period at 1 kHz
        assert!((samples[12] - 0.5).abs() < 1e-4);
    }
}
