//! Configuration for PetalMix

use crate::error::{PetalMixError, Result};

/// Sample layout of a PCM buffer. Samples are always interleaved `f32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioSpec {
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(PetalMixError::invalid("Sample rate must be greater than 0"));
        }
        if self.channels == 0 {
            return Err(PetalMixError::invalid(
                "Channel count must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Size of one frame in samples.
    pub fn frame_len(&self) -> usize {
        self.channels as usize
    }

    pub fn ms_to_frames(&self, ms: u64) -> u64 {
        ms * self.sample_rate as u64 / 1000
    }

    pub fn frames_to_ms(&self, frames: u64) -> u64 {
        frames * 1000 / self.sample_rate as u64
    }
}

impl Default for AudioSpec {
    fn default() -> Self {
        Self::new(48000, 2)
    }
}

impl std::fmt::Display for AudioSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} Hz, {} ch", self.sample_rate, self.channels)
    }
}

/// Configuration descriptor for a device-backed mixer
#[derive(Debug, Clone)]
pub struct MixerDesc {
    /// Requested device sample rate
    pub sample_rate: u32,
    /// Requested output channels
    pub channels: u16,
    /// Frames per device callback (None lets the backend choose)
    pub block_size: Option<u32>,
    /// Capacity of the event queue drained by `Mixer::poll_events`
    pub event_capacity: usize,
}

impl Default for MixerDesc {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            block_size: None,
            event_capacity: 256,
        }
    }
}

impl MixerDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    pub fn block_size(mut self, frames: u32) -> Self {
        self.block_size = Some(frames);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn spec(&self) -> AudioSpec {
        AudioSpec::new(self.sample_rate, self.channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_frame_conversion() {
        let spec = AudioSpec::new(48000, 2);
        assert_eq!(spec.ms_to_frames(1000), 48000);
        assert_eq!(spec.ms_to_frames(500), 24000);
        assert_eq!(spec.frames_to_ms(24000), 500);
        assert_eq!(spec.frame_len(), 2);
    }

    #[test]
    fn test_invalid_spec() {
        assert!(AudioSpec::new(0, 2).validate().is_err());
        assert!(AudioSpec::new(44100, 0).validate().is_err());
        assert!(AudioSpec::new(44100, 1).validate().is_ok());
    }

    #[test]
    fn test_desc_builder() {
        let desc = MixerDesc::new().sample_rate(44100).channels(6).block_size(256);
        assert_eq!(desc.spec(), AudioSpec::new(44100, 6));
        assert_eq!(desc.block_size, Some(256));
    }
}
