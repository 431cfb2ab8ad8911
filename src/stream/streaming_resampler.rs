use crate::error::{PetalMixError, Result};
use rubato::{
    FastFixedIn, PolynomialDegree, Resampler, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};
use std::collections::VecDeque;

/// Upper bound for runtime ratio changes (frequency ratio 0.1..=10).
pub(crate) const MAX_RELATIVE_RATIO: f64 = 10.0;

/// Type of resampler algorithm to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResamplerType {
    /// Fast polynomial resampler - lower quality but cheap enough for the mix thread
    #[default]
    Fast,
    /// Sinc interpolation resampler - higher quality but slower
    Sinc,
}

enum ResamplerImpl {
    Fast(FastFixedIn<f32>),
    Sinc(SincFixedIn<f32>),
}

impl ResamplerImpl {
    fn process_into(
        &mut self,
        input: &[Vec<f32>],
        output: &mut [Vec<f32>],
    ) -> std::result::Result<(usize, usize), rubato::ResampleError> {
        match self {
            Self::Fast(r) => r.process_into_buffer(input, output, None),
            Self::Sinc(r) => r.process_into_buffer(input, output, None),
        }
    }

    fn process_partial_into(
        &mut self,
        input: &[Vec<f32>],
        output: &mut [Vec<f32>],
    ) -> std::result::Result<(usize, usize), rubato::ResampleError> {
        match self {
            Self::Fast(r) => r.process_partial_into_buffer(Some(input), output, None),
            Self::Sinc(r) => r.process_partial_into_buffer(Some(input), output, None),
        }
    }

    fn set_relative_ratio(&mut self, ratio: f64) -> std::result::Result<(), rubato::ResampleError> {
        match self {
            Self::Fast(r) => r.set_resample_ratio_relative(ratio, true),
            Self::Sinc(r) => r.set_resample_ratio_relative(ratio, true),
        }
    }

    fn output_frames_max(&self) -> usize {
        match self {
            Self::Fast(r) => r.output_frames_max(),
            Self::Sinc(r) => r.output_frames_max(),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Fast(r) => r.reset(),
            Self::Sinc(r) => r.reset(),
        }
    }
}

/// Streaming resampler fed with fixed-size input chunks. The owning
/// [`AudioStream`](super::AudioStream) queues input until a whole chunk is
/// available, or hands over a short chunk once the stream is flushed.
pub(crate) struct StreamingResampler {
    resampler: ResamplerImpl,
    source_sample_rate: u32,
    target_sample_rate: u32,
    channels: usize,
    chunk_frames: usize,
    // Planar scratch kept between calls so steady-state processing never allocates
    input_waves: Vec<Vec<f32>>,
    output_waves: Vec<Vec<f32>>,
}

impl StreamingResampler {
    /// Creates a new streaming resampler
    ///
    /// # Arguments
    /// * `source_sample_rate` - Rate of the samples pushed into the stream
    /// * `target_sample_rate` - Rate pulled out of the stream
    /// * `channels` - Number of interleaved channels (after channel conversion)
    /// * `chunk_frames` - Fixed number of input frames per resampler call
    /// * `resampler_type` - Algorithm to use
    pub fn new(
        source_sample_rate: u32,
        target_sample_rate: u32,
        channels: u16,
        chunk_frames: usize,
        resampler_type: ResamplerType,
    ) -> Result<Self> {
        if source_sample_rate == 0 || target_sample_rate == 0 {
            return Err(PetalMixError::AudioFormat(
                "Sample rates must be greater than 0".to_string(),
            ));
        }

        if channels == 0 {
            return Err(PetalMixError::AudioFormat(
                "Channel count must be greater than 0".to_string(),
            ));
        }

        if chunk_frames == 0 {
            return Err(PetalMixError::AudioFormat(
                "Chunk size must be greater than 0".to_string(),
            ));
        }

        // target/source (output/input)
        let resample_ratio = target_sample_rate as f64 / source_sample_rate as f64;

        log::debug!(
            "Creating {:?} resampler: {} Hz -> {} Hz ({} ch, chunk: {} frames)",
            resampler_type,
            source_sample_rate,
            target_sample_rate,
            channels,
            chunk_frames
        );

        let resampler = match resampler_type {
            ResamplerType::Fast => {
                let fast = FastFixedIn::new(
                    resample_ratio,
                    MAX_RELATIVE_RATIO,
                    PolynomialDegree::Cubic,
                    chunk_frames,
                    channels as usize,
                )
                .map_err(|e| {
                    PetalMixError::AudioFormat(format!("Failed to create fast resampler: {}", e))
                })?;
                ResamplerImpl::Fast(fast)
            }
            ResamplerType::Sinc => {
                let params = SincInterpolationParameters {
                    sinc_len: 128,
                    f_cutoff: 0.95,
                    interpolation: SincInterpolationType::Linear,
                    oversampling_factor: 128,
                    window: WindowFunction::BlackmanHarris2,
                };

                let sinc = SincFixedIn::new(
                    resample_ratio,
                    MAX_RELATIVE_RATIO,
                    params,
                    chunk_frames,
                    channels as usize,
                )
                .map_err(|e| {
                    PetalMixError::AudioFormat(format!("Failed to create sinc resampler: {}", e))
                })?;
                ResamplerImpl::Sinc(sinc)
            }
        };

        let output_frames_max = resampler.output_frames_max();
        let channels = channels as usize;

        Ok(Self {
            resampler,
            source_sample_rate,
            target_sample_rate,
            channels,
            chunk_frames,
            input_waves: vec![Vec::with_capacity(chunk_frames); channels],
            output_waves: vec![vec![0.0; output_frames_max]; channels],
        })
    }

    /// Fixed number of input frames consumed per full call
    pub fn chunk_frames(&self) -> usize {
        self.chunk_frames
    }

    /// Scales the base conversion ratio, e.g. `0.5` produces half as many output frames.
    pub fn set_relative_ratio(&mut self, ratio: f64) -> Result<()> {
        self.resampler
            .set_relative_ratio(ratio)
            .map_err(|e| PetalMixError::AudioFormat(format!("Failed to change ratio: {}", e)))
    }

    /// Resamples interleaved `input` and appends interleaved output to `output`.
    ///
    /// `input` must hold exactly `chunk_frames` frames unless `partial` is set, in
    /// which case any shorter tail is accepted (used when the stream is flushed).
    ///
    /// Returns the number of output frames appended.
    pub fn process_interleaved(
        &mut self,
        input: &[f32],
        output: &mut VecDeque<f32>,
        partial: bool,
    ) -> Result<usize> {
        let channels = self.channels;
        let input_frames = input.len() / channels;

        if !partial && input_frames != self.chunk_frames {
            return Err(PetalMixError::AudioFormat(format!(
                "Input size mismatch: expected {} frames, got {} frames",
                self.chunk_frames, input_frames
            )));
        }

        // De-interleave input
        for (ch, wave) in self.input_waves.iter_mut().enumerate() {
            wave.clear();
            wave.extend(input.chunks_exact(channels).map(|frame| frame[ch]));
        }

        let result = if partial {
            self.resampler
                .process_partial_into(&self.input_waves, &mut self.output_waves)
        } else {
            self.resampler
                .process_into(&self.input_waves, &mut self.output_waves)
        };
        let (_, output_frames) = result.map_err(|e| {
            PetalMixError::AudioFormat(format!("Streaming resampling error: {}", e))
        })?;

        // Re-interleave output
        for frame_idx in 0..output_frames {
            for wave in &self.output_waves {
                output.push_back(wave[frame_idx]);
            }
        }

        Ok(output_frames)
    }

    pub fn source_sample_rate(&self) -> u32 {
        self.source_sample_rate
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    /// Reset the internal state of the resampler
    pub fn reset(&mut self) {
        self.resampler.reset();
    }
}
