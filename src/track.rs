//! Playback voices.
//!
//! A track owns two private streams: the decode stage, which holds PCM in
//! the bound input's own layout, and the output stage, which converts to the
//! mixer's rate and the channel count the track's spatialization needs.
//! Fade, loop and silence handling sit between the two and run only from
//! the mixer's pull path.

use crate::audio_data::Audio;
use crate::config::AudioSpec;
use crate::decoder::{DECODE_CHUNK_FRAMES, DecodeStatus, TrackDecoder};
use crate::error::{PetalMixError, Result};
use crate::events::MixerEvent;
use crate::group::{Group, GroupId};
use crate::math::Vec3;
use crate::mixer::{Mixer, MixerShared};
use crate::playback::{Fade, FrameOrMs, PlayOptions, PlayState, Silence};
use crate::spatial::{SpeakerGains, Spatialization, VbapTable, VectorBackend};
use crate::stream::{AudioStream, PcmStream};
use crossbeam_channel::Sender;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Unique identifier for a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(u64);

impl TrackId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Track({})", self.0)
    }
}

/// Hook that sees (and may modify) interleaved PCM along with its layout.
pub type TrackCallback = Arc<dyn Fn(&Track, &mut [f32], AudioSpec) + Send + Sync>;

/// Hook fired when a track stops.
pub type StoppedCallback = Arc<dyn Fn(&Track) + Send + Sync>;

enum TrackInput {
    Audio {
        audio: Audio,
        decoder: Box<dyn TrackDecoder>,
    },
    Stream(PcmStream),
}

/// Result of pulling one chunk from the input.
enum Fetch {
    Chunk { frames: usize, silence: bool },
    /// Nothing queued yet; a stream may still be fed
    Starved,
    EndOfData,
}

/// What one track contributed to a mix pass.
pub(crate) struct Rendered {
    pub frames: usize,
    pub channels: usize,
    pub gains: Option<SpeakerGains>,
    /// Fire-and-forget track that just finished and can be reused
    pub reclaim: bool,
}

impl Rendered {
    const NOTHING: Self = Self {
        frames: 0,
        channels: 0,
        gains: None,
        reclaim: false,
    };
}

/// Mixer-wide values a track needs while rendering.
pub(crate) struct RenderEnv<'a> {
    pub backend: VectorBackend,
    pub vbap: Option<&'a VbapTable>,
}

pub(crate) struct TrackState {
    destroyed: bool,
    state: PlayState,
    input: Option<TrackInput>,
    input_spec: AudioSpec,
    mixer_spec: AudioSpec,
    decode_stage: AudioStream,
    output: AudioStream,
    /// Decoder has nothing more until the next seek
    exhausted: bool,
    /// Input is done; playing out what the output stage still holds
    draining: bool,
    fade: Fade,
    loops: i64,
    loop_start: u64,
    max_frame: Option<u64>,
    silence: Silence,
    silence_total: u64,
    produced_since_loop: bool,
    position: u64,
    /// Bumped by anything that invalidates an in-flight chunk
    epoch: u64,
    last_error: Option<String>,
    spatialization: Spatialization,
    gains: Option<SpeakerGains>,
    gains_dirty: bool,
    raw_callback: Option<TrackCallback>,
    cooked_callback: Option<TrackCallback>,
    stopped_callback: Option<StoppedCallback>,
    pub(crate) tags: BTreeSet<String>,
    pub(crate) group: GroupId,
    pub(crate) fire_and_forget: bool,
    pub(crate) pooled: bool,
    chunk: Vec<f32>,
}

impl TrackState {
    fn new(mixer_spec: AudioSpec, group: GroupId) -> Result<Self> {
        Ok(Self {
            destroyed: false,
            state: PlayState::Stopped,
            input: None,
            input_spec: mixer_spec,
            mixer_spec,
            decode_stage: AudioStream::passthrough(mixer_spec)?,
            output: AudioStream::new(mixer_spec, mixer_spec)?,
            exhausted: false,
            draining: false,
            fade: Fade::default(),
            loops: 0,
            loop_start: 0,
            max_frame: None,
            silence: Silence::None,
            silence_total: 0,
            produced_since_loop: false,
            position: 0,
            epoch: 0,
            last_error: None,
            spatialization: Spatialization::None,
            gains: None,
            gains_dirty: true,
            raw_callback: None,
            cooked_callback: None,
            stopped_callback: None,
            tags: BTreeSet::new(),
            group,
            fire_and_forget: false,
            pooled: false,
            chunk: Vec::with_capacity(DECODE_CHUNK_FRAMES * mixer_spec.frame_len()),
        })
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn output_spec(&self) -> AudioSpec {
        AudioSpec::new(
            self.mixer_spec.sample_rate,
            self.spatialization.track_channels(self.mixer_spec.channels),
        )
    }

    fn reconfigure(&mut self) -> Result<()> {
        let out = self.output_spec();
        self.decode_stage.set_format(self.input_spec, self.input_spec)?;
        self.output.set_format(self.input_spec, out)?;
        self.gains_dirty = true;
        Ok(())
    }

    /// Stops without firing callbacks or events, for rebinding.
    fn reset(&mut self) {
        self.state = PlayState::Stopped;
        self.decode_stage.clear();
        self.output.clear();
        self.exhausted = false;
        self.draining = false;
        self.fade = Fade::default();
        self.silence = Silence::None;
        self.position = 0;
        self.epoch += 1;
    }

    fn bind(&mut self, input: Option<TrackInput>) -> Result<()> {
        self.reset();
        self.input = input;
        self.last_error = None;
        if let Some(spec) = self.input.as_ref().map(|input| match input {
            TrackInput::Audio { audio, .. } => audio.spec(),
            TrackInput::Stream(stream) => stream.spec(),
        }) {
            self.input_spec = spec;
        }
        self.reconfigure()
    }

    /// Input ran out naturally. The track stays playing until the output
    /// stage's converted tail fits in one pass, then stops.
    fn drain(&mut self) {
        self.output.flush();
        self.draining = true;
    }

    /// Transitions to stopped, reporting it. Queued output is kept when the
    /// audio ran out naturally so the current pass can drain it.
    fn halt(
        &mut self,
        id: TrackId,
        events: &Sender<MixerEvent>,
        clear: bool,
    ) -> Option<StoppedCallback> {
        self.state = PlayState::Stopped;
        self.draining = false;
        self.fade = Fade::default();
        self.silence = Silence::None;
        self.decode_stage.clear();
        if clear {
            self.output.clear();
        } else {
            self.output.flush();
        }
        self.epoch += 1;
        log::debug!("{} stopped at frame {}", id, self.position);
        let _ = events.try_send(MixerEvent::TrackStopped { track: id });
        self.stopped_callback.clone()
    }

    fn play(&mut self, options: &PlayOptions) -> Result<()> {
        if self.destroyed {
            return Err(PetalMixError::Destroyed("Track"));
        }
        let spec = self.input_spec;
        let start = options.start_frame.map_or(0, |f| f.to_frames(spec));
        let loop_start = options.loop_start.map_or(0, |f| f.to_frames(spec));
        let mut loops = options.loops.unwrap_or(0);
        if loops < -1 {
            return Err(PetalMixError::invalid(format!("Invalid loop count {}", loops)));
        }

        match self.input.as_mut() {
            None => return Err(PetalMixError::misuse("No audio currently assigned")),
            Some(TrackInput::Stream(_)) => {
                if start > 0 {
                    return Err(PetalMixError::misuse(
                        "Can't start a streaming track at a nonzero frame",
                    ));
                }
                if loops != 0 {
                    log::warn!("Ignoring loop count on a streaming track");
                    loops = 0;
                }
            }
            Some(TrackInput::Audio { audio, decoder }) => {
                if let Some(total) = audio.duration().frames() {
                    if start > total {
                        return Err(PetalMixError::invalid(format!(
                            "Start frame {} past the end ({} frames)",
                            start, total
                        )));
                    }
                    if loops != 0 && loop_start >= total {
                        return Err(PetalMixError::invalid(format!(
                            "Loop start {} past the end ({} frames)",
                            loop_start, total
                        )));
                    }
                }
                decoder.seek(start)?;
            }
        }

        // A stopped track only holds the drained tail of its last run, which
        // a restart from its stopped callback plays out gaplessly
        if self.state != PlayState::Stopped {
            self.output.clear();
        }
        self.decode_stage.clear();
        self.exhausted = false;
        self.draining = false;
        self.loops = loops;
        self.loop_start = loop_start;
        self.max_frame = options.max_frame.map(|f| f.to_frames(spec));
        self.fade = options
            .fade_in
            .map_or_else(Fade::default, |f| Fade::fade_in(f.to_frames(spec)));
        self.silence_total = options.append_silence.map_or(0, |f| f.to_frames(spec));
        self.silence = Silence::new(self.silence_total);
        self.produced_since_loop = false;
        self.position = start;
        self.state = PlayState::Playing;
        self.epoch += 1;
        self.last_error = None;
        self.pooled = false;
        Ok(())
    }

    /// Runs the decoder until the decode stage has something or the
    /// decoder is exhausted.
    fn refill(&mut self) {
        let Some(TrackInput::Audio { decoder, .. }) = self.input.as_mut() else {
            return;
        };
        while !self.exhausted && self.decode_stage.available_frames() == 0 {
            match decoder.decode(&mut self.decode_stage) {
                DecodeStatus::More => {}
                DecodeStatus::EndOfStream => {
                    self.exhausted = true;
                    self.decode_stage.flush();
                }
                DecodeStatus::Error(e) => {
                    log::warn!("Decode error, ending track data: {}", e);
                    self.last_error = Some(e);
                    self.exhausted = true;
                    self.decode_stage.flush();
                }
            }
        }
    }

    fn chunk_limit(&self) -> usize {
        let mut limit = DECODE_CHUNK_FRAMES as u64;
        if let Some(left) = self.fade.out_remaining() {
            limit = limit.min(left);
        }
        limit as usize
    }

    /// Pulls the next chunk of input (or owed silence) into `self.chunk`,
    /// at most `wanted` frames.
    fn fetch(&mut self, wanted: usize) -> Fetch {
        let channels = self.input_spec.frame_len();
        let mut limit = self.chunk_limit().min(wanted.max(1));

        if let Silence::Active(left) = self.silence {
            if left == 0 {
                return Fetch::EndOfData;
            }
            let frames = limit.min(left as usize);
            self.chunk.clear();
            self.chunk.resize(frames * channels, 0.0);
            self.silence = Silence::Active(left - frames as u64);
            return Fetch::Chunk {
                frames,
                silence: true,
            };
        }

        if let Some(max) = self.max_frame {
            if self.position >= max {
                return Fetch::EndOfData;
            }
            limit = limit.min((max - self.position) as usize);
        }

        let frames = if let Some(TrackInput::Stream(stream)) = self.input.as_ref() {
            let mut stream = stream.lock();
            let available = stream.available_frames();
            if available == 0 {
                return if stream.is_flushed() {
                    Fetch::EndOfData
                } else {
                    Fetch::Starved
                };
            }
            let frames = available.min(limit);
            self.chunk.resize(frames * channels, 0.0);
            stream.get(&mut self.chunk) / channels
        } else if self.input.is_some() {
            self.refill();
            let available = self.decode_stage.available_frames();
            if available == 0 {
                return Fetch::EndOfData;
            }
            let frames = available.min(limit);
            self.chunk.resize(frames * channels, 0.0);
            self.decode_stage.get(&mut self.chunk) / channels
        } else {
            return Fetch::EndOfData;
        };

        self.position += frames as u64;
        self.produced_since_loop = true;
        Fetch::Chunk {
            frames,
            silence: false,
        }
    }

    /// Whether the input has nothing left after the chunk just fetched.
    fn at_end(&mut self) -> bool {
        if self.max_frame.is_some_and(|max| self.position >= max) {
            return true;
        }
        if let Some(TrackInput::Stream(stream)) = self.input.as_ref() {
            let mut stream = stream.lock();
            return stream.is_flushed() && stream.available_frames() == 0;
        }
        if self.input.is_none() {
            return true;
        }
        self.refill();
        self.decode_stage.available_frames() == 0
    }

    /// Input frames worth fetching to top the output stage up to `frames`.
    /// Without resampling this is exact so a track that ends leaves nothing
    /// queued behind it.
    fn wanted_input(&mut self, frames: usize) -> Option<usize> {
        let available = self.output.available_frames();
        if available >= frames {
            return None;
        }
        let direct = self.output.input_spec().sample_rate == self.output.output_spec().sample_rate
            && self.output.frequency_ratio() == 1.0;
        Some(if direct {
            frames - available
        } else {
            DECODE_CHUNK_FRAMES
        })
    }

    /// Fades and queues the fetched chunk, then handles a finished fade-out,
    /// the end of owed silence or the end of real data.
    fn finish_chunk(
        &mut self,
        id: TrackId,
        events: &Sender<MixerEvent>,
        frames: usize,
        silence: bool,
    ) {
        let channels = self.input_spec.frame_len();
        let samples = &mut self.chunk[..frames * channels];
        let faded_out = self.fade.apply(samples, channels);
        if let Err(e) = self.output.put(samples) {
            log::warn!("{} dropped a chunk: {}", id, e);
        }

        if faded_out {
            // A finished fade-out can't loop back to life
            self.loops = 0;
            self.drain();
        } else if silence {
            if self.silence == Silence::Active(0) {
                self.drain();
            }
        } else if self.at_end() {
            self.end_of_data(id, events);
        }
    }

    /// Real data ran out: loop, start owed silence, or stop.
    fn end_of_data(&mut self, id: TrackId, events: &Sender<MixerEvent>) {
        if self.loops != 0 {
            if !self.produced_since_loop {
                log::warn!("{} produced nothing in a loop iteration, not looping", id);
                self.loops = 0;
            } else if let Some(TrackInput::Audio { decoder, .. }) = self.input.as_mut() {
                match decoder.seek(self.loop_start) {
                    Ok(()) => {
                        self.decode_stage.clear();
                        self.exhausted = false;
                        self.position = self.loop_start;
                        self.produced_since_loop = false;
                        self.silence = Silence::new(self.silence_total);
                        if self.loops > 0 {
                            self.loops -= 1;
                        }
                        log::trace!("{} looped, {} left", id, self.loops);
                        let _ = events.try_send(MixerEvent::TrackLooped {
                            track: id,
                            loops_remaining: self.loops,
                        });
                        return;
                    }
                    Err(e) => {
                        log::warn!("{} failed to seek to its loop start: {}", id, e);
                        self.last_error = Some(e.to_string());
                    }
                }
            }
        }
        if let Silence::Pending(frames) = self.silence {
            self.silence = Silence::Active(frames);
            return;
        }
        self.drain();
    }
}

pub(crate) struct TrackShared {
    id: TrackId,
    pub(crate) slot: usize,
    mixer: Weak<MixerShared>,
    events: Sender<MixerEvent>,
    state: ReentrantMutex<RefCell<TrackState>>,
}

impl TrackShared {
    pub(crate) fn new(
        slot: usize,
        mixer: Weak<MixerShared>,
        events: Sender<MixerEvent>,
        mixer_spec: AudioSpec,
        group: GroupId,
    ) -> Result<Self> {
        Ok(Self {
            id: TrackId::next(),
            slot,
            mixer,
            events,
            state: ReentrantMutex::new(RefCell::new(TrackState::new(mixer_spec, group)?)),
        })
    }

    pub(crate) fn id(&self) -> TrackId {
        self.id
    }

    /// Runs `f` with the track locked. `f` must not call back into user code.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut TrackState) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    fn with_live<R>(&self, f: impl FnOnce(&mut TrackState) -> Result<R>) -> Result<R> {
        self.with(|state| {
            if state.destroyed {
                Err(PetalMixError::Destroyed("Track"))
            } else {
                f(state)
            }
        })
    }

    pub(crate) fn play(&self, options: &PlayOptions) -> Result<()> {
        self.with(|state| state.play(options))?;
        log::debug!("{} playing", self.id);
        Ok(())
    }

    /// Stops or arms a fade-out. Returns the stopped callback to fire once
    /// every lock is released.
    pub(crate) fn stop(&self, fade_out: FrameOrMs) -> Result<Option<StoppedCallback>> {
        self.with_live(|state| {
            if state.state == PlayState::Stopped {
                return Ok(None);
            }
            let frames = fade_out.to_frames(state.input_spec);
            if frames == 0 {
                return Ok(state.halt(self.id, &self.events, true));
            }
            state.fade = Fade::fade_out(frames);
            Ok(None)
        })
    }

    pub(crate) fn belongs_to(&self, mixer: &Arc<MixerShared>) -> bool {
        std::ptr::eq(self.mixer.as_ptr(), Arc::as_ptr(mixer))
    }

    pub(crate) fn set_paused(&self, paused: bool) -> Result<()> {
        self.with_live(|state| {
            state.state = match (state.state, paused) {
                (PlayState::Playing, true) => PlayState::Paused,
                (PlayState::Paused, false) => PlayState::Playing,
                (current, _) => current,
            };
            Ok(())
        })
    }

    pub(crate) fn set_gain(&self, gain: f32) -> Result<()> {
        self.with_live(|state| state.output.set_gain(gain))
    }

    pub(crate) fn set_mixer_spec(&self, spec: AudioSpec) -> Result<()> {
        self.with(|state| {
            state.mixer_spec = spec;
            state.reconfigure()
        })
    }

    /// Marks the track dead and drops its binding and callbacks.
    pub(crate) fn destroy(&self) -> bool {
        self.with(|state| {
            if state.destroyed {
                return false;
            }
            state.reset();
            state.destroyed = true;
            state.input = None;
            state.raw_callback = None;
            state.cooked_callback = None;
            state.stopped_callback = None;
            state.tags.clear();
            true
        })
    }

    /// Decodes as needed and pulls up to `frames` output frames into `out`.
    ///
    /// User callbacks run with the track still locked but never while its
    /// state is borrowed, so they may call back into this track. Stopped
    /// callbacks that restart the track keep it producing in the same pass.
    pub(crate) fn render(
        self: &Arc<Self>,
        frames: usize,
        out: &mut [f32],
        env: &RenderEnv<'_>,
    ) -> Rendered {
        let handle = Track {
            shared: self.clone(),
        };
        let guard = self.state.lock();

        loop {
            let mut state = guard.borrow_mut();
            if state.destroyed || state.state != PlayState::Playing {
                break;
            }
            if state.draining {
                if state.output.available_frames() > frames {
                    break;
                }
                if let Some(callback) = state.halt(self.id, &self.events, false) {
                    drop(state);
                    callback(&handle);
                }
                continue;
            }
            let Some(wanted) = state.wanted_input(frames) else {
                break;
            };

            match state.fetch(wanted) {
                Fetch::Starved => break,
                Fetch::EndOfData => state.end_of_data(self.id, &self.events),
                Fetch::Chunk { frames: got, silence } => {
                    if let Some(callback) = state.raw_callback.clone().filter(|_| !silence) {
                        let epoch = state.epoch;
                        let spec = state.input_spec;
                        let mut chunk = std::mem::take(&mut state.chunk);
                        drop(state);
                        callback(&handle, &mut chunk[..got * spec.frame_len()], spec);
                        state = guard.borrow_mut();
                        state.chunk = chunk;
                        if state.epoch != epoch {
                            continue;
                        }
                    }
                    state.finish_chunk(self.id, &self.events, got, silence);
                }
            }
        }

        let mut state = guard.borrow_mut();
        if state.destroyed || state.state == PlayState::Paused {
            return Rendered::NOTHING;
        }
        let channels = state.output.output_spec().frame_len();
        let wanted = (frames * channels).min(out.len());
        let got = state.output.get(&mut out[..wanted]) / channels;

        let mut reclaim = false;
        if state.state == PlayState::Stopped {
            state.output.clear();
            if state.fire_and_forget && !state.pooled {
                state.input = None;
                state.pooled = true;
                reclaim = true;
            }
        }
        if state.gains_dirty {
            let mixer_channels = state.mixer_spec.channels;
            state.gains = state
                .spatialization
                .gains(env.backend, mixer_channels, env.vbap);
            state.gains_dirty = false;
        }
        let gains = state.gains;
        let cooked = state.cooked_callback.clone().filter(|_| got > 0);
        let spec = state.output.output_spec();
        drop(state);

        if let Some(callback) = cooked {
            callback(&handle, &mut out[..got * channels], spec);
        }
        Rendered {
            frames: got,
            channels,
            gains,
            reclaim,
        }
    }
}

/// Handle to one playback voice. Clones refer to the same track.
#[derive(Clone)]
pub struct Track {
    pub(crate) shared: Arc<TrackShared>,
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Track {
    pub(crate) fn from_shared(shared: Arc<TrackShared>) -> Self {
        Self { shared }
    }

    fn read<R>(&self, f: impl FnOnce(&TrackState) -> R) -> R {
        self.shared.with(|state| f(state))
    }

    pub fn id(&self) -> TrackId {
        self.shared.id
    }

    pub fn mixer(&self) -> Result<Mixer> {
        self.shared
            .mixer
            .upgrade()
            .map(Mixer::from_shared)
            .ok_or(PetalMixError::Destroyed("Mixer"))
    }

    /// Binds an audio (or unbinds with `None`). Stops the track without
    /// firing its stopped callback.
    pub fn set_audio(&self, audio: Option<&Audio>) -> Result<()> {
        match audio {
            Some(audio) => self.bind_audio(audio, audio.open_track()?),
            None => {
                self.shared.with_live(|state| state.bind(None))?;
                log::debug!("{} unbound", self.id());
                Ok(())
            }
        }
    }

    /// Binds `audio` through a decoder opened ahead of time, so callers
    /// holding the mixer lock never wait on I/O.
    pub(crate) fn bind_audio(&self, audio: &Audio, decoder: Box<dyn TrackDecoder>) -> Result<()> {
        let input = TrackInput::Audio {
            decoder,
            audio: audio.clone(),
        };
        self.shared.with_live(|state| state.bind(Some(input)))?;
        log::debug!("{} bound to {}", self.id(), audio.id());
        Ok(())
    }

    /// Binds an application-fed stream in place of an audio.
    pub fn set_stream(&self, stream: Option<&PcmStream>) -> Result<()> {
        let input = stream.cloned().map(TrackInput::Stream);
        self.shared.with_live(|state| state.bind(input))
    }

    pub fn audio(&self) -> Option<Audio> {
        self.read(|state| match state.input.as_ref() {
            Some(TrackInput::Audio { audio, .. }) => Some(audio.clone()),
            _ => None,
        })
    }

    pub fn stream(&self) -> Option<PcmStream> {
        self.read(|state| match state.input.as_ref() {
            Some(TrackInput::Stream(stream)) => Some(stream.clone()),
            _ => None,
        })
    }

    /// Starts (or restarts) playback from `options.start_frame`.
    pub fn play(&self, options: &PlayOptions) -> Result<()> {
        self.shared.play(options)
    }

    /// Stops immediately when `fade_out_frames` is zero, otherwise fades out
    /// over that many input frames and stops when the fade completes.
    /// Stopping a stopped track does nothing.
    pub fn stop(&self, fade_out_frames: u64) -> Result<()> {
        if let Some(callback) = self.shared.stop(FrameOrMs::Frames(fade_out_frames))? {
            callback(self);
        }
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        self.shared.set_paused(true)
    }

    pub fn resume(&self) -> Result<()> {
        self.shared.set_paused(false)
    }

    pub fn state(&self) -> PlayState {
        self.read(|state| state.state)
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlayState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.state() == PlayState::Paused
    }

    pub fn is_destroyed(&self) -> bool {
        self.read(|state| state.destroyed)
    }

    /// Moves the read position of an audio-bound track.
    pub fn seek(&self, frame: u64) -> Result<()> {
        self.shared.with_live(|state| {
            match state.input.as_mut() {
                None => return Err(PetalMixError::misuse("No audio currently assigned")),
                Some(TrackInput::Stream(_)) => {
                    return Err(PetalMixError::misuse("Can't seek a streaming track"));
                }
                Some(TrackInput::Audio { audio, decoder }) => {
                    if let Some(total) = audio.duration().frames() {
                        if frame > total {
                            return Err(PetalMixError::invalid(format!(
                                "Frame {} past the end ({} frames)",
                                frame, total
                            )));
                        }
                    }
                    decoder.seek(frame)?;
                }
            }
            state.decode_stage.clear();
            state.output.clear();
            state.exhausted = false;
            state.draining = false;
            state.position = frame;
            state.silence = Silence::new(state.silence_total);
            state.epoch += 1;
            Ok(())
        })
    }

    /// Current frame in the input's own rate.
    pub fn position(&self) -> u64 {
        self.read(|state| state.position)
    }

    /// Frames left until the track stops, when that is knowable.
    pub fn remaining_frames(&self) -> Option<u64> {
        self.read(|state| {
            if state.state == PlayState::Stopped || state.loops < 0 {
                return None;
            }
            let Some(TrackInput::Audio { audio, .. }) = state.input.as_ref() else {
                return None;
            };
            let total = audio.duration().frames()?;
            let end = state.max_frame.map_or(total, |max| max.min(total));
            let per_loop = end.saturating_sub(state.loop_start);
            let silence = match state.silence {
                Silence::Pending(frames) | Silence::Active(frames) => frames,
                Silence::None => 0,
            };
            Some(end.saturating_sub(state.position) + state.loops as u64 * per_loop + silence)
        })
    }

    pub fn loops(&self) -> i64 {
        self.read(|state| state.loops)
    }

    /// Changes the remaining loop count of a playing track.
    pub fn set_loops(&self, loops: i64) -> Result<()> {
        if loops < -1 {
            return Err(PetalMixError::invalid(format!("Invalid loop count {}", loops)));
        }
        self.shared.with_live(|state| {
            if matches!(state.input, Some(TrackInput::Stream(_))) && loops != 0 {
                return Err(PetalMixError::misuse("Streaming tracks can't loop"));
            }
            state.loops = loops;
            Ok(())
        })
    }

    pub fn gain(&self) -> f32 {
        self.read(|state| state.output.gain())
    }

    pub fn set_gain(&self, gain: f32) -> Result<()> {
        self.shared.set_gain(gain)
    }

    pub fn frequency_ratio(&self) -> f32 {
        self.read(|state| state.output.frequency_ratio())
    }

    /// Speeds playback up (`> 1.0`) or down; also shifts pitch.
    pub fn set_frequency_ratio(&self, ratio: f32) -> Result<()> {
        self.shared
            .with_live(|state| state.output.set_frequency_ratio(ratio))
    }

    pub fn output_channel_map(&self) -> Option<Vec<usize>> {
        self.read(|state| state.output.channel_map().map(<[usize]>::to_vec))
    }

    /// Reorders the track's output channels before mixing. The map has one
    /// entry per output channel and resets when spatialization or the mixer
    /// format changes the channel count.
    pub fn set_output_channel_map(&self, map: Option<&[usize]>) -> Result<()> {
        self.shared
            .with_live(|state| state.output.set_channel_map(map))
    }

    /// Layout of the bound input (the mixer's layout when unbound).
    pub fn input_spec(&self) -> AudioSpec {
        self.read(|state| state.input_spec)
    }

    pub fn ms_to_frames(&self, ms: u64) -> u64 {
        self.input_spec().ms_to_frames(ms)
    }

    pub fn frames_to_ms(&self, frames: u64) -> u64 {
        self.input_spec().frames_to_ms(frames)
    }

    /// Last decoder failure seen while playing, cleared by `play`.
    pub fn last_error(&self) -> Option<String> {
        self.read(|state| state.last_error.clone())
    }

    pub fn spatialization(&self) -> Spatialization {
        self.read(|state| state.spatialization)
    }

    pub fn set_spatialization(&self, spatialization: Spatialization) -> Result<()> {
        self.shared.with_live(|state| {
            let reformat = spatialization.track_channels(state.mixer_spec.channels)
                != state.spatialization.track_channels(state.mixer_spec.channels);
            state.spatialization = spatialization;
            state.gains_dirty = true;
            if reformat {
                state.reconfigure()?;
            }
            Ok(())
        })
    }

    /// Places the track in 3D space around the listener.
    pub fn set_position_3d(&self, position: Vec3) -> Result<()> {
        self.set_spatialization(Spatialization::Position(position))
    }

    /// Forces stereo output with explicit per-side gains.
    pub fn set_stereo(&self, left: f32, right: f32) -> Result<()> {
        self.set_spatialization(Spatialization::Stereo { left, right })
    }

    /// Called with each decoded chunk before fades are applied.
    pub fn set_raw_callback<F>(&self, callback: Option<F>) -> Result<()>
    where
        F: Fn(&Track, &mut [f32], AudioSpec) + Send + Sync + 'static,
    {
        self.shared.with_live(|state| {
            state.raw_callback = callback.map(|f| Arc::new(f) as TrackCallback);
            Ok(())
        })
    }

    /// Called with each converted buffer right before it is mixed.
    pub fn set_cooked_callback<F>(&self, callback: Option<F>) -> Result<()>
    where
        F: Fn(&Track, &mut [f32], AudioSpec) + Send + Sync + 'static,
    {
        self.shared.with_live(|state| {
            state.cooked_callback = callback.map(|f| Arc::new(f) as TrackCallback);
            Ok(())
        })
    }

    /// Called whenever the track stops. The callback may restart the track.
    pub fn set_stopped_callback<F>(&self, callback: Option<F>) -> Result<()>
    where
        F: Fn(&Track) + Send + Sync + 'static,
    {
        self.shared.with_live(|state| {
            state.stopped_callback = callback.map(|f| Arc::new(f) as StoppedCallback);
            Ok(())
        })
    }

    pub fn tags(&self) -> Vec<String> {
        self.read(|state| state.tags.iter().cloned().collect())
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.read(|state| state.tags.contains(tag))
    }

    pub fn tag(&self, tag: &str) -> Result<()> {
        self.mixer()?.tag_track(self, tag)
    }

    pub fn untag(&self, tag: &str) -> Result<()> {
        self.mixer()?.untag_track(self, tag)
    }

    pub fn group(&self) -> Result<Group> {
        let mixer = self.mixer()?;
        let id = self.shared.with_live(|state| Ok(state.group))?;
        Ok(Group::new(&mixer, id))
    }

    /// Moves the track into `group`, which must belong to the same mixer.
    pub fn set_group(&self, group: &Group) -> Result<()> {
        self.mixer()?.move_track(self, group)
    }

    /// Removes the track from its mixer and releases its binding.
    pub fn destroy(&self) {
        match self.mixer() {
            Ok(mixer) => mixer.destroy_track(self),
            Err(_) => {
                self.shared.destroy();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn setup(samples: &[f32], spec: AudioSpec) -> (Context, Mixer, Track, Audio) {
        setup_converted(samples, spec, spec)
    }

    fn setup_converted(
        samples: &[f32],
        audio_spec: AudioSpec,
        mixer_spec: AudioSpec,
    ) -> (Context, Mixer, Track, Audio) {
        let ctx = Context::new();
        ctx.init().unwrap();
        let mixer = Mixer::new(&ctx, mixer_spec).unwrap();
        let audio = ctx.load_raw_audio(samples, audio_spec).unwrap();
        let track = mixer.create_track().unwrap();
        track.set_audio(Some(&audio)).unwrap();
        (ctx, mixer, track, audio)
    }

    #[test]
    fn test_play_without_audio_fails() {
        let ctx = Context::new();
        ctx.init().unwrap();
        let mixer = Mixer::new(&ctx, AudioSpec::new(8000, 1)).unwrap();
        let track = mixer.create_track().unwrap();
        let err = track.play(&PlayOptions::new()).unwrap_err();
        assert_eq!(err.to_string(), "No audio currently assigned");
        assert_eq!(track.state(), PlayState::Stopped);
        ctx.quit();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let spec = AudioSpec::new(8000, 1);
        let (ctx, _mixer, track, _audio) = setup(&[0.5; 100], spec);
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = stops.clone();
        track
            .set_stopped_callback(Some(move |_: &Track| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        track.play(&PlayOptions::new()).unwrap();
        track.stop(0).unwrap();
        track.stop(0).unwrap();
        assert_eq!(track.state(), PlayState::Stopped);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        ctx.quit();
    }

    #[test]
    fn test_seek_round_trip() {
        let spec = AudioSpec::new(8000, 2);
        let (ctx, _mixer, track, _audio) = setup(&[0.0; 2000], spec);
        for frame in [0, 1, 500, 999] {
            track.seek(frame).unwrap();
            assert_eq!(track.position(), frame);
        }
        assert!(track.seek(5000).is_err());
        ctx.quit();
    }

    #[test]
    fn test_pause_resume_only_from_expected_state() {
        let spec = AudioSpec::new(8000, 1);
        let (ctx, mixer, track, _audio) = setup(&[0.5; 100], spec);
        track.resume().unwrap();
        assert_eq!(track.state(), PlayState::Stopped);

        track.play(&PlayOptions::new()).unwrap();
        track.pause().unwrap();
        let mut out = [0.0; 10];
        mixer.generate(&mut out).unwrap();
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(track.position(), 0);

        track.resume().unwrap();
        mixer.generate(&mut out).unwrap();
        assert!(out.iter().all(|&s| s == 0.5));
        ctx.quit();
    }

    #[test]
    fn test_streaming_track_rules() {
        let ctx = Context::new();
        ctx.init().unwrap();
        let spec = AudioSpec::new(8000, 1);
        let mixer = Mixer::new(&ctx, spec).unwrap();
        let track = mixer.create_track().unwrap();
        let stream = PcmStream::new(spec).unwrap();
        track.set_stream(Some(&stream)).unwrap();
        assert!(track.audio().is_none());
        assert_eq!(track.stream(), Some(stream.clone()));

        let start = PlayOptions::new().start_frame(FrameOrMs::Frames(10));
        assert!(matches!(track.play(&start), Err(PetalMixError::Misuse(_))));
        assert!(matches!(track.seek(0), Err(PetalMixError::Misuse(_))));

        track.play(&PlayOptions::new()).unwrap();
        let mut out = [1.0; 4];
        mixer.generate(&mut out).unwrap();
        assert_eq!(out, [0.0; 4]);
        assert!(track.is_playing());

        stream.put(&[0.25; 4]).unwrap();
        stream.flush();
        mixer.generate(&mut out).unwrap();
        assert_eq!(out, [0.25; 4]);
        mixer.generate(&mut out).unwrap();
        assert_eq!(track.state(), PlayState::Stopped);
        ctx.quit();
    }

    #[test]
    fn test_rebinding_stops_silently() {
        let spec = AudioSpec::new(8000, 1);
        let (ctx, _mixer, track, audio) = setup(&[0.5; 100], spec);
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = stops.clone();
        track
            .set_stopped_callback(Some(move |_: &Track| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        track.play(&PlayOptions::new()).unwrap();
        track.set_audio(Some(&audio)).unwrap();
        assert_eq!(track.state(), PlayState::Stopped);
        assert_eq!(stops.load(Ordering::SeqCst), 0);
        ctx.quit();
    }

    #[test]
    fn test_stopped_callback_can_restart_without_gap() {
        let spec = AudioSpec::new(8000, 1);
        let (ctx, mixer, track, _audio) = setup(&[0.5; 10], spec);
        let restarts = Arc::new(AtomicUsize::new(0));
        let counter = restarts.clone();
        track
            .set_stopped_callback(Some(move |t: &Track| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    t.play(&PlayOptions::new()).unwrap();
                }
            }))
            .unwrap();
        track.play(&PlayOptions::new()).unwrap();

        let mut out = [0.0; 30];
        mixer.generate(&mut out).unwrap();
        assert!(out[..20].iter().all(|&s| s == 0.5));
        assert!(out[20..].iter().all(|&s| s == 0.0));
        assert_eq!(restarts.load(Ordering::SeqCst), 2);
        ctx.quit();
    }

    #[test]
    fn test_raw_callback_sees_input_layout() {
        let spec = AudioSpec::new(8000, 2);
        let (ctx, mixer, track, _audio) = setup(&[0.5; 20], spec);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        track
            .set_raw_callback(Some(move |_: &Track, pcm: &mut [f32], spec: AudioSpec| {
                log.lock().unwrap().push((pcm.len(), spec.channels));
                pcm.iter_mut().for_each(|s| *s *= 2.0);
            }))
            .unwrap();
        track.play(&PlayOptions::new()).unwrap();

        let mut out = [0.0; 20];
        mixer.generate(&mut out).unwrap();
        assert!(out.iter().all(|&s| s == 1.0));
        assert_eq!(seen.lock().unwrap()[0], (20, 2));
        ctx.quit();
    }

    #[test]
    fn test_max_frame_and_silence() {
        let spec = AudioSpec::new(8000, 1);
        let (ctx, mixer, track, _audio) = setup(&[0.5; 100], spec);
        let options = PlayOptions::new()
            .max_frame(FrameOrMs::Frames(4))
            .append_silence(FrameOrMs::Frames(3));
        track.play(&options).unwrap();
        assert_eq!(track.remaining_frames(), Some(7));

        let mut out = [1.0; 5];
        mixer.generate(&mut out).unwrap();
        assert_eq!(out, [0.5, 0.5, 0.5, 0.5, 0.0]);
        assert!(track.is_playing());
        mixer.generate(&mut out[..2]).unwrap();
        assert_eq!(track.state(), PlayState::Stopped);
        assert_eq!(track.position(), 4);
        ctx.quit();
    }

    #[test]
    fn test_output_channel_map() {
        let spec = AudioSpec::new(8000, 2);
        let samples: Vec<f32> = [0.25, 0.75].repeat(8);
        let (ctx, mixer, track, _audio) = setup(&samples, spec);
        track.set_output_channel_map(Some(&[1, 1])).unwrap();
        assert_eq!(track.output_channel_map(), Some(vec![1, 1]));
        track.play(&PlayOptions::new()).unwrap();

        let mut out = [0.0; 4];
        mixer.generate(&mut out).unwrap();
        assert_eq!(out, [0.75; 4]);

        track.set_position_3d(Vec3::ZERO).unwrap();
        assert!(track.output_channel_map().is_none());
        ctx.quit();
    }

    /// 0.25 for the first 10000 frames at 44.1kHz, 0.75 after.
    fn two_level_audio() -> Vec<f32> {
        let mut samples = vec![0.25; 10000];
        samples.resize(20000, 0.75);
        samples
    }

    fn settled_near(out: &[f32], level: f32) -> bool {
        out[out.len() / 2..].iter().all(|&s| (s - level).abs() < 0.01)
    }

    #[test]
    fn test_restart_drops_converted_tail() {
        let (ctx, mixer, track, _audio) = setup_converted(
            &two_level_audio(),
            AudioSpec::new(44100, 1),
            AudioSpec::new(48000, 1),
        );
        let late = PlayOptions::new().start_frame(FrameOrMs::Frames(12000));
        track.play(&late).unwrap();
        let mut out = [0.0; 480];
        mixer.generate(&mut out).unwrap();
        assert!(settled_near(&out, 0.75));

        track.play(&PlayOptions::new()).unwrap();
        mixer.generate(&mut out).unwrap();
        assert!(out.iter().all(|&s| s < 0.5), "old position leaked: {:?}", &out[..4]);
        assert!(settled_near(&out, 0.25));
        ctx.quit();
    }

    #[test]
    fn test_seek_on_converted_track() {
        let (ctx, mixer, track, _audio) = setup_converted(
            &two_level_audio(),
            AudioSpec::new(44100, 1),
            AudioSpec::new(48000, 1),
        );
        track.play(&PlayOptions::new()).unwrap();
        let mut out = [0.0; 480];
        mixer.generate(&mut out).unwrap();
        assert!(settled_near(&out, 0.25));

        track.seek(12000).unwrap();
        assert_eq!(track.position(), 12000);
        mixer.generate(&mut out).unwrap();
        assert!(settled_near(&out, 0.75));

        track.stop(0).unwrap();
        mixer.generate(&mut out).unwrap();
        assert!(out.iter().all(|&s| s == 0.0));
        ctx.quit();
    }

    #[test]
    fn test_fade_out_on_converted_track() {
        let (ctx, mixer, track, _audio) = setup_converted(
            &[0.5; 44100],
            AudioSpec::new(44100, 1),
            AudioSpec::new(48000, 1),
        );
        track.play(&PlayOptions::new()).unwrap();
        let mut out = [0.0; 480];
        mixer.generate(&mut out).unwrap();

        track.stop(441).unwrap();
        assert!(track.is_playing());
        let mut heard = Vec::new();
        for _ in 0..8 {
            mixer.generate(&mut out).unwrap();
            heard.extend_from_slice(&out);
            if track.state() == PlayState::Stopped {
                break;
            }
        }
        assert_eq!(track.state(), PlayState::Stopped);
        assert!(heard.windows(2).all(|w| w[1] <= w[0] + 1e-3));
        assert!(heard.last().is_some_and(|&s| s.abs() < 1e-3));
        ctx.quit();
    }

    #[test]
    fn test_loop_across_rate_conversion() {
        let (ctx, mixer, track, _audio) = setup_converted(
            &[0.5; 4410],
            AudioSpec::new(44100, 1),
            AudioSpec::new(48000, 1),
        );
        track.play(&PlayOptions::new().loops(1)).unwrap();

        let mut audible = 0;
        let mut out = [0.0; 480];
        for _ in 0..40 {
            mixer.generate(&mut out).unwrap();
            audible += out.iter().filter(|&&s| s > 0.25).count();
            if track.state() == PlayState::Stopped {
                break;
            }
        }
        assert_eq!(track.state(), PlayState::Stopped);
        // Two passes of 0.1s at the mixer rate
        assert!((audible as i64 - 9600).abs() < 64, "audible frames {}", audible);

        let looped: Vec<_> = mixer
            .poll_events()
            .into_iter()
            .filter_map(|event| match event {
                MixerEvent::TrackLooped {
                    loops_remaining, ..
                } => Some(loops_remaining),
                _ => None,
            })
            .collect();
        assert_eq!(looped, vec![0]);
        ctx.quit();
    }

    #[test]
    fn test_gain_and_ratio_validation() {
        let spec = AudioSpec::new(8000, 1);
        let (ctx, _mixer, track, _audio) = setup(&[0.5; 4], spec);
        assert!(track.last_error().is_none());
        assert!(track.set_gain(-1.0).is_err());
        assert!(track.set_frequency_ratio(100.0).is_err());
        track.set_gain(0.5).unwrap();
        assert_eq!(track.gain(), 0.5);
        ctx.quit();
    }
}
