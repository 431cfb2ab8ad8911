//! Push/pull PCM streams with channel conversion and resampling.
//!
//! [`AudioStream`] is the conversion stage used throughout the engine: decoders
//! push into a track's input stream, the track pushes processed frames into its
//! output stream, and the mixer pulls mixer-rate frames back out. Samples are
//! always interleaved `f32`.

mod streaming_resampler;

pub use streaming_resampler::ResamplerType;

use crate::config::AudioSpec;
use crate::error::{PetalMixError, Result};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use streaming_resampler::{MAX_RELATIVE_RATIO, StreamingResampler};

const RESAMPLE_CHUNK_FRAMES: usize = 256;

/// Converts one interleaved frame between channel layouts.
///
/// Mono fans out to the front pair, anything folding down to mono is averaged,
/// other layouts copy the shared channels and zero the rest.
pub(crate) fn convert_frame(frame: &[f32], out_channels: usize, mut push: impl FnMut(f32)) {
    let in_channels = frame.len();
    if in_channels == out_channels {
        frame.iter().copied().for_each(push);
    } else if out_channels == 1 {
        let sum: f32 = frame.iter().sum();
        push(sum / in_channels as f32);
    } else if in_channels == 1 {
        push(frame[0]);
        push(frame[0]);
        for _ in 2..out_channels {
            push(0.0);
        }
    } else {
        for ch in 0..out_channels {
            push(frame.get(ch).copied().unwrap_or(0.0));
        }
    }
}

/// Caller-owned samples queued without copying. Dropping the chunk runs its
/// release callback.
struct SharedChunk {
    samples: Arc<[f32]>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for SharedChunk {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

pub struct AudioStream {
    input_spec: AudioSpec,
    output_spec: AudioSpec,
    /// Channel-converted frames waiting for the resampler (input rate)
    pending: VecDeque<f32>,
    /// Frames ready to be pulled (output rate and layout)
    ready: VecDeque<f32>,
    /// Input-layout chunks absorbed on the next pull
    shared: VecDeque<SharedChunk>,
    resampler: Option<StreamingResampler>,
    resampler_type: ResamplerType,
    chunk: Vec<f32>,
    gain: f32,
    frequency_ratio: f32,
    flushed: bool,
    /// Output channel `i` is taken from converted channel `map[i]`
    channel_map: Option<Vec<usize>>,
    frame: Vec<f32>,
}

impl std::fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStream")
            .field("input_spec", &self.input_spec)
            .field("output_spec", &self.output_spec)
            .field("pending_samples", &self.pending.len())
            .field("ready_samples", &self.ready.len())
            .field("shared_chunks", &self.shared.len())
            .field("gain", &self.gain)
            .field("frequency_ratio", &self.frequency_ratio)
            .field("flushed", &self.flushed)
            .field("channel_map", &self.channel_map)
            .finish()
    }
}

impl AudioStream {
    pub fn new(input_spec: AudioSpec, output_spec: AudioSpec) -> Result<Self> {
        input_spec.validate()?;
        output_spec.validate()?;
        let mut stream = Self {
            input_spec,
            output_spec,
            pending: VecDeque::new(),
            ready: VecDeque::new(),
            shared: VecDeque::new(),
            resampler: None,
            resampler_type: ResamplerType::default(),
            chunk: Vec::new(),
            gain: 1.0,
            frequency_ratio: 1.0,
            flushed: false,
            channel_map: None,
            frame: Vec::new(),
        };
        stream.rebuild_resampler()?;
        Ok(stream)
    }

    /// Stream whose input and output layouts match; behaves as a plain FIFO.
    pub fn passthrough(spec: AudioSpec) -> Result<Self> {
        Self::new(spec, spec)
    }

    pub fn input_spec(&self) -> AudioSpec {
        self.input_spec
    }

    pub fn output_spec(&self) -> AudioSpec {
        self.output_spec
    }

    /// Changes either side of the conversion. Queued audio is discarded when
    /// anything actually changes.
    pub fn set_format(&mut self, input_spec: AudioSpec, output_spec: AudioSpec) -> Result<()> {
        input_spec.validate()?;
        output_spec.validate()?;
        if input_spec == self.input_spec && output_spec == self.output_spec {
            return Ok(());
        }
        if output_spec.channels != self.output_spec.channels && self.channel_map.take().is_some() {
            log::debug!("Output channel count changed, dropping channel map");
        }
        self.input_spec = input_spec;
        self.output_spec = output_spec;
        self.pending.clear();
        self.ready.clear();
        self.shared.clear();
        self.flushed = false;
        self.rebuild_resampler()
    }

    fn needs_resampler(&self) -> bool {
        self.input_spec.sample_rate != self.output_spec.sample_rate || self.frequency_ratio != 1.0
    }

    fn rebuild_resampler(&mut self) -> Result<()> {
        if !self.needs_resampler() {
            self.resampler = None;
            return Ok(());
        }
        let mut resampler = StreamingResampler::new(
            self.input_spec.sample_rate,
            self.output_spec.sample_rate,
            self.output_spec.channels,
            RESAMPLE_CHUNK_FRAMES,
            self.resampler_type,
        )?;
        if self.frequency_ratio != 1.0 {
            resampler.set_relative_ratio(1.0 / self.frequency_ratio as f64)?;
        }
        self.chunk = Vec::with_capacity(RESAMPLE_CHUNK_FRAMES * self.output_spec.frame_len());
        self.resampler = Some(resampler);
        Ok(())
    }

    pub fn set_resampler_type(&mut self, resampler_type: ResamplerType) -> Result<()> {
        if resampler_type != self.resampler_type {
            self.resampler_type = resampler_type;
            self.rebuild_resampler()?;
        }
        Ok(())
    }

    fn check_whole_frames(&self, samples: &[f32]) -> Result<()> {
        let in_channels = self.input_spec.frame_len();
        if samples.len() % in_channels != 0 {
            return Err(PetalMixError::invalid(format!(
                "Sample count {} is not a multiple of {} channels",
                samples.len(),
                in_channels
            )));
        }
        Ok(())
    }

    /// Queues interleaved samples in the input layout.
    pub fn put(&mut self, samples: &[f32]) -> Result<()> {
        self.check_whole_frames(samples)?;
        self.absorb_shared();
        self.convert_in(samples);
        Ok(())
    }

    /// Queues samples without copying them up front. `release` runs once the
    /// stream no longer needs them: after they are converted on a pull, or
    /// when the stream is cleared, reformatted or dropped. It runs with the
    /// stream locked and must not call back into it.
    pub fn put_shared<F>(&mut self, samples: Arc<[f32]>, release: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.check_whole_frames(&samples)?;
        self.shared.push_back(SharedChunk {
            samples,
            release: Some(Box::new(release)),
        });
        self.flushed = false;
        Ok(())
    }

    fn absorb_shared(&mut self) {
        while let Some(chunk) = self.shared.pop_front() {
            self.convert_in(&chunk.samples);
        }
    }

    fn convert_in(&mut self, samples: &[f32]) {
        let in_channels = self.input_spec.frame_len();
        let out_channels = self.output_spec.frame_len();
        let target = if self.resampler.is_some() {
            &mut self.pending
        } else {
            &mut self.ready
        };
        for frame in samples.chunks_exact(in_channels) {
            convert_frame(frame, out_channels, |s| target.push_back(s));
        }
        self.flushed = false;
    }

    /// Marks the end of the currently queued input so a short final chunk is
    /// converted instead of waiting for more data.
    pub fn flush(&mut self) {
        self.flushed = true;
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Drops all queued audio and resampler history.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.ready.clear();
        self.shared.clear();
        self.flushed = false;
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }

    fn process_pending(&mut self) {
        let flushed = self.flushed;
        self.absorb_shared();
        self.flushed = flushed;
        let Some(resampler) = self.resampler.as_mut() else {
            return;
        };
        let channels = self.output_spec.frame_len();
        loop {
            let pending_frames = self.pending.len() / channels;
            let chunk_frames = resampler.chunk_frames();
            let partial = if pending_frames >= chunk_frames {
                false
            } else if self.flushed && pending_frames > 0 {
                true
            } else {
                break;
            };

            let take = pending_frames.min(chunk_frames) * channels;
            self.chunk.clear();
            self.chunk.extend(self.pending.drain(..take));
            if let Err(e) = resampler.process_interleaved(&self.chunk, &mut self.ready, partial) {
                log::warn!("Dropping {} queued samples: {}", take, e);
            }
        }
    }

    /// Frames that can be pulled right now without more input.
    pub fn available_frames(&mut self) -> usize {
        self.process_pending();
        self.ready.len() / self.output_spec.frame_len()
    }

    /// Input frames queued but not yet converted to the output rate.
    pub fn queued_frames(&self) -> usize {
        let shared: usize = self.shared.iter().map(|c| c.samples.len()).sum();
        self.pending.len() / self.output_spec.frame_len() + shared / self.input_spec.frame_len()
    }

    /// Pulls up to `out.len()` samples (rounded down to whole output frames)
    /// and returns the number of samples written.
    pub fn get(&mut self, out: &mut [f32]) -> usize {
        self.process_pending();
        let channels = self.output_spec.frame_len();
        let wanted = out.len() - out.len() % channels;
        let count = wanted.min(self.ready.len());
        let gain = self.gain;
        for (dst, src) in out[..count].iter_mut().zip(self.ready.drain(..count)) {
            *dst = src * gain;
        }
        if let Some(map) = &self.channel_map {
            for frame in out[..count].chunks_exact_mut(channels) {
                self.frame.clear();
                self.frame.extend_from_slice(frame);
                for (dst, &src) in frame.iter_mut().zip(map) {
                    *dst = self.frame[src];
                }
            }
        }
        count
    }

    pub fn channel_map(&self) -> Option<&[usize]> {
        self.channel_map.as_deref()
    }

    /// Reorders (or duplicates) output channels. `map[i]` names the source
    /// channel for output channel `i`; `None` restores the identity order.
    /// The map is dropped whenever the output channel count changes.
    pub fn set_channel_map(&mut self, map: Option<&[usize]>) -> Result<()> {
        let channels = self.output_spec.frame_len();
        if let Some(map) = map {
            if map.len() != channels || map.iter().any(|&c| c >= channels) {
                return Err(PetalMixError::invalid(format!(
                    "Channel map {:?} doesn't fit {} output channels",
                    map, channels
                )));
            }
        }
        self.channel_map = map.map(<[usize]>::to_vec);
        Ok(())
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn set_gain(&mut self, gain: f32) -> Result<()> {
        if !(gain >= 0.0) {
            return Err(PetalMixError::invalid("Gain must be non-negative"));
        }
        self.gain = gain;
        Ok(())
    }

    pub fn frequency_ratio(&self) -> f32 {
        self.frequency_ratio
    }

    /// Speeds up (`> 1.0`) or slows down (`< 1.0`) playback through the stream.
    pub fn set_frequency_ratio(&mut self, ratio: f32) -> Result<()> {
        let max = MAX_RELATIVE_RATIO as f32;
        if !(ratio >= 1.0 / max && ratio <= max) {
            return Err(PetalMixError::invalid(format!(
                "Frequency ratio {} outside {}..={}",
                ratio,
                1.0 / max,
                max
            )));
        }
        let had_resampler = self.resampler.is_some();
        self.frequency_ratio = ratio;
        let needs_resampler = self.needs_resampler();
        match self.resampler.as_mut() {
            Some(resampler) if needs_resampler => {
                resampler.set_relative_ratio(1.0 / ratio as f64)
            }
            _ => {
                self.rebuild_resampler()?;
                if had_resampler != self.resampler.is_some() {
                    // Move queued audio to whichever side is now active
                    if self.resampler.is_some() {
                        self.pending.extend(self.ready.drain(..));
                    } else {
                        self.ready.extend(self.pending.drain(..));
                    }
                }
                Ok(())
            }
        }
    }
}

/// Application-fed PCM stream that can be bound to a track in place of an
/// [`Audio`](crate::Audio). Clones share the same queue.
#[derive(Clone, Debug)]
pub struct PcmStream {
    inner: Arc<Mutex<AudioStream>>,
}

impl PcmStream {
    pub fn new(spec: AudioSpec) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(AudioStream::passthrough(spec)?)),
        })
    }

    pub fn spec(&self) -> AudioSpec {
        self.inner.lock().input_spec()
    }

    pub fn put(&self, samples: &[f32]) -> Result<()> {
        self.inner.lock().put(samples)
    }

    /// See [`AudioStream::put_shared`].
    pub fn put_shared<F>(&self, samples: Arc<[f32]>, release: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.lock().put_shared(samples, release)
    }

    /// Signals that no more data follows; a track bound to this stream stops
    /// once the queue drains.
    pub fn flush(&self) {
        self.inner.lock().flush();
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn queued_frames(&self) -> usize {
        self.inner.lock().available_frames()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, AudioStream> {
        self.inner.lock()
    }
}

impl PartialEq for PcmStream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
