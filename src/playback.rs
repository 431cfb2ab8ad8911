use crate::config::AudioSpec;

/// Playback state of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayState {
    #[default]
    Stopped,
    Paused,
    Playing,
}

/// A duration given either in frames or in milliseconds. Milliseconds are
/// converted at the track's input sample rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrMs {
    Frames(u64),
    Ms(u64),
}

impl FrameOrMs {
    pub fn to_frames(self, spec: AudioSpec) -> u64 {
        match self {
            Self::Frames(frames) => frames,
            Self::Ms(ms) => spec.ms_to_frames(ms),
        }
    }
}

/// Options for [`Track::play`](crate::Track::play). Unset fields keep their
/// defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayOptions {
    /// Extra iterations after the first: `0` plays once, `-1` loops forever
    pub loops: Option<i64>,
    /// Treat this frame as the end of the audio
    pub max_frame: Option<FrameOrMs>,
    pub start_frame: Option<FrameOrMs>,
    /// Where each loop iteration restarts
    pub loop_start: Option<FrameOrMs>,
    pub fade_in: Option<FrameOrMs>,
    /// Silence played after the real audio ends, before the track stops
    pub append_silence: Option<FrameOrMs>,
}

impl PlayOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loops(mut self, loops: i64) -> Self {
        self.loops = Some(loops);
        self
    }

    pub fn max_frame(mut self, max: FrameOrMs) -> Self {
        self.max_frame = Some(max);
        self
    }

    pub fn start_frame(mut self, start: FrameOrMs) -> Self {
        self.start_frame = Some(start);
        self
    }

    pub fn loop_start(mut self, start: FrameOrMs) -> Self {
        self.loop_start = Some(start);
        self
    }

    pub fn fade_in(mut self, length: FrameOrMs) -> Self {
        self.fade_in = Some(length);
        self
    }

    pub fn append_silence(mut self, length: FrameOrMs) -> Self {
        self.append_silence = Some(length);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FadeDirection {
    #[default]
    None,
    In,
    Out,
}

/// Linear gain ramp over a fixed number of frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fade {
    direction: FadeDirection,
    total: u64,
    remaining: u64,
}

impl Fade {
    pub fn fade_in(frames: u64) -> Self {
        Self::new(FadeDirection::In, frames)
    }

    pub fn fade_out(frames: u64) -> Self {
        Self::new(FadeDirection::Out, frames)
    }

    fn new(direction: FadeDirection, frames: u64) -> Self {
        if frames == 0 {
            return Self::default();
        }
        Self {
            direction,
            total: frames,
            remaining: frames,
        }
    }

    pub fn direction(&self) -> FadeDirection {
        self.direction
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Frames left before a running fade-out completes.
    pub fn out_remaining(&self) -> Option<u64> {
        (self.direction == FadeDirection::Out).then_some(self.remaining)
    }

    /// Multiplier for the `offset`-th frame from the current fade position.
    pub fn gain_at(&self, offset: u64) -> f32 {
        if self.direction == FadeDirection::None {
            return 1.0;
        }
        let done = self.total - self.remaining + offset;
        let pct = (done.min(self.total) as f64 / self.total as f64) as f32;
        match self.direction {
            FadeDirection::In => pct,
            FadeDirection::Out => 1.0 - pct,
            FadeDirection::None => 1.0,
        }
    }

    /// Applies the envelope to interleaved `samples` in place and advances
    /// it. Returns `true` when a fade-out finished inside this chunk; frames
    /// after that point are silenced.
    pub fn apply(&mut self, samples: &mut [f32], channels: usize) -> bool {
        if self.direction == FadeDirection::None {
            return false;
        }
        let frames = samples.len() / channels;
        let faded = self.remaining.min(frames as u64) as usize;
        for (i, frame) in samples.chunks_exact_mut(channels).take(faded).enumerate() {
            let gain = self.gain_at(i as u64);
            frame.iter_mut().for_each(|s| *s *= gain);
        }
        self.remaining -= faded as u64;
        if self.remaining > 0 {
            return false;
        }

        let finished_out = self.direction == FadeDirection::Out;
        if finished_out {
            samples[faded * channels..].fill(0.0);
        }
        *self = Self::default();
        finished_out
    }
}

/// Trailing silence owed after the real audio ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Silence {
    #[default]
    None,
    /// Real audio is still playing; this much silence follows it
    Pending(u64),
    /// Real audio ended; this much silence is left
    Active(u64),
}

impl Silence {
    pub fn new(frames: u64) -> Self {
        if frames == 0 {
            Self::None
        } else {
            Self::Pending(frames)
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }
}
