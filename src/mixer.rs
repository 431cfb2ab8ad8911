//! The mixing engine.
//!
//! A mixer owns every track, every group and the output. The pull callback
//! ([`MixerShared::render`]) runs on the device thread for device mixers and
//! on the caller's thread for [`Mixer::generate`]. It holds the mixer lock
//! for the whole pass, so bulk operations are atomic with respect to it;
//! the lock is reentrant so user callbacks invoked during the pass may call
//! back into the mixer.

use crate::audio_data::Audio;
use crate::config::{AudioSpec, MixerDesc};
use crate::context::Context;
use crate::engine::{self, DeviceHandle};
use crate::error::{PetalMixError, Result};
use crate::events::MixerEvent;
use crate::group::{Group, GroupArena, GroupCallback, GroupEntry, GroupId};
use crate::playback::{FrameOrMs, PlayOptions};
use crate::spatial::{VbapTable, VectorBackend};
use crate::track::{RenderEnv, Rendered, StoppedCallback, Track, TrackShared};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Hook run on the final mix before it reaches the output.
pub type PostmixCallback = Arc<dyn Fn(&Mixer, &mut [f32], AudioSpec) + Send + Sync>;

struct GroupSpan {
    id: GroupId,
    start: usize,
    end: usize,
    postmix: Option<GroupCallback>,
}

/// Buffers reused across passes; grown on demand, never shrunk.
#[derive(Default)]
struct MixScratch {
    track: Vec<f32>,
    group: Vec<f32>,
    members: Vec<Arc<TrackShared>>,
    spans: Vec<GroupSpan>,
    reclaim: Vec<usize>,
}

pub(crate) struct MixerState {
    destroyed: bool,
    spec: AudioSpec,
    tracks: Vec<Option<Arc<TrackShared>>>,
    free_slots: Vec<usize>,
    /// Slots of finished fire-and-forget tracks ready for reuse
    pool: Vec<usize>,
    groups: GroupArena,
    tags: HashMap<String, Vec<Arc<TrackShared>>>,
    vbap: Option<Arc<VbapTable>>,
    gain: f32,
    postmix: Option<PostmixCallback>,
    mixing: bool,
    scratch: MixScratch,
}

impl MixerState {
    fn track(&self, slot: usize) -> Option<&Arc<TrackShared>> {
        self.tracks.get(slot).and_then(Option::as_ref)
    }

    fn live_tracks(&self) -> impl Iterator<Item = &Arc<TrackShared>> {
        self.tracks.iter().flatten()
    }
}

pub(crate) struct MixerShared {
    headless: bool,
    backend: VectorBackend,
    state: ReentrantMutex<RefCell<MixerState>>,
    events_tx: Sender<MixerEvent>,
    events_rx: Receiver<MixerEvent>,
    device: Mutex<Option<DeviceHandle>>,
}

impl MixerShared {
    fn new(
        backend: VectorBackend,
        spec: AudioSpec,
        event_capacity: usize,
        headless: bool,
    ) -> Result<Self> {
        spec.validate()?;
        let (events_tx, events_rx) = crossbeam_channel::bounded(event_capacity.max(1));
        Ok(Self {
            headless,
            backend,
            state: ReentrantMutex::new(RefCell::new(MixerState {
                destroyed: false,
                spec,
                tracks: Vec::new(),
                free_slots: Vec::new(),
                pool: Vec::new(),
                groups: GroupArena::new(),
                tags: HashMap::new(),
                vbap: VbapTable::for_channels(spec.channels).map(Arc::new),
                gain: 1.0,
                postmix: None,
                mixing: false,
                scratch: MixScratch::default(),
            })),
            events_tx,
            events_rx,
            device: Mutex::new(None),
        })
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state.lock().borrow().destroyed
    }

    /// Mixes every playing track into `out`, which must hold whole frames in
    /// the mixer's layout.
    pub(crate) fn render(self: &Arc<Self>, out: &mut [f32]) {
        out.fill(0.0);
        let guard = self.state.lock();

        let (spec, gain, vbap, postmix, mut scratch) = {
            let mut state = guard.borrow_mut();
            if state.destroyed || state.mixing {
                return;
            }
            state.mixing = true;
            let mut scratch = std::mem::take(&mut state.scratch);
            for (id, entry) in state.groups.iter() {
                let start = scratch.members.len();
                scratch.members.extend(entry.members.iter().cloned());
                scratch.spans.push(GroupSpan {
                    id,
                    start,
                    end: scratch.members.len(),
                    postmix: entry.postmix.clone(),
                });
            }
            (
                state.spec,
                state.gain,
                state.vbap.clone(),
                state.postmix.clone(),
                scratch,
            )
        };

        let channels = spec.frame_len();
        let frames = out.len() / channels;
        let samples = frames * channels;
        let multi = scratch.spans.len() > 1;
        {
            let MixScratch {
                track,
                group,
                members,
                spans,
                reclaim,
            } = &mut scratch;
            // Track output is at most stereo wider than the mixer (mono mixers)
            let track_len = frames * channels.max(2);
            if track.len() < track_len {
                track.resize(track_len, 0.0);
            }
            if multi && group.len() < samples {
                group.resize(samples, 0.0);
            }

            let env = RenderEnv {
                backend: self.backend,
                vbap: vbap.as_deref(),
            };
            for span in spans.iter() {
                let target: &mut [f32] = if multi {
                    group[..samples].fill(0.0);
                    &mut group[..samples]
                } else {
                    &mut out[..samples]
                };

                let mut contributed = 0;
                for member in &members[span.start..span.end] {
                    let rendered = member.render(frames, track, &env);
                    if rendered.reclaim {
                        reclaim.push(member.slot);
                    }
                    if rendered.frames == 0 {
                        continue;
                    }
                    let pcm = &track[..rendered.frames * rendered.channels];
                    mix_track(target, pcm, channels, &rendered, gain);
                    contributed = contributed.max(rendered.frames);
                }
                log::trace!(
                    "Group {:?} contributed {}/{} frames",
                    span.id,
                    contributed,
                    frames
                );

                if let Some(callback) = &span.postmix {
                    let handle = Group::from_weak(Arc::downgrade(self), span.id);
                    callback(&handle, target, spec);
                }
                if multi {
                    for (dst, src) in out[..samples].iter_mut().zip(group[..samples].iter()) {
                        *dst += *src;
                    }
                }
            }
        }

        if let Some(callback) = postmix {
            callback(&Mixer::from_shared(self.clone()), &mut out[..samples], spec);
        }

        let mut state = guard.borrow_mut();
        state.mixing = false;
        for slot in scratch.reclaim.drain(..) {
            if state.track(slot).is_some() && !state.pool.contains(&slot) {
                state.pool.push(slot);
            }
        }
        scratch.members.clear();
        scratch.spans.clear();
        state.scratch = scratch;
    }
}

impl Drop for MixerShared {
    fn drop(&mut self) {
        if let Some(device) = self.device.get_mut().take() {
            device.close(false);
        }
    }
}

/// Sums one track's converted output into `dst` (mixer layout).
fn mix_track(dst: &mut [f32], src: &[f32], channels: usize, rendered: &Rendered, gain: f32) {
    let Some(speakers) = rendered.gains else {
        for (d, s) in dst.iter_mut().zip(src) {
            *d += s * gain;
        }
        return;
    };

    let [g0, g1] = speakers.gains.map(|g| g * gain);
    let [c0, c1] = speakers.speakers;
    for (frame, input) in dst
        .chunks_exact_mut(channels)
        .zip(src.chunks_exact(rendered.channels))
    {
        match input {
            [mono] => {
                frame[c0] += mono * g0;
                frame[c1] += mono * g1;
            }
            [left, right, ..] => {
                frame[c0] += left * g0;
                frame[c1] += right * g1;
            }
            [] => {}
        }
    }
}

/// Handle to a mixer. Clones share the same engine.
#[derive(Clone)]
pub struct Mixer {
    shared: Arc<MixerShared>,
}

impl std::fmt::Debug for Mixer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mixer")
            .field("spec", &self.spec())
            .field("headless", &self.shared.headless)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Mixer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Mixer {
    /// Creates a mixer without a device; audio is pulled with
    /// [`generate`](Self::generate).
    pub fn new(ctx: &Context, spec: AudioSpec) -> Result<Self> {
        ctx.ensure_initialized()?;
        let shared = Arc::new(MixerShared::new(
            ctx.vector_backend(),
            spec,
            MixerDesc::default().event_capacity,
            true,
        )?);
        ctx.register_mixer(&shared);
        log::info!("Created headless mixer ({})", spec);
        Ok(Self { shared })
    }

    /// Opens the default output device and mixes into it.
    pub fn open_device(ctx: &Context, desc: &MixerDesc) -> Result<Self> {
        ctx.ensure_initialized()?;
        let spec = desc.spec();
        let shared = Arc::new(MixerShared::new(
            ctx.vector_backend(),
            spec,
            desc.event_capacity,
            false,
        )?);
        let device = engine::open(
            Arc::downgrade(&shared),
            desc,
            shared.events_tx.clone(),
        )?;
        let mixer = Self { shared };
        if device.spec() != spec {
            mixer.apply_spec(device.spec())?;
        }
        *mixer.shared.device.lock() = Some(device);
        ctx.register_mixer(&mixer.shared);
        log::info!("Opened device mixer ({})", mixer.spec());
        Ok(mixer)
    }

    pub(crate) fn from_shared(shared: Arc<MixerShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<MixerShared> {
        Arc::downgrade(&self.shared)
    }

    fn with<R>(&self, f: impl FnOnce(&mut MixerState) -> R) -> R {
        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    fn with_live<R>(&self, f: impl FnOnce(&mut MixerState) -> Result<R>) -> Result<R> {
        self.with(|state| {
            if state.destroyed {
                Err(PetalMixError::Destroyed("Mixer"))
            } else {
                f(state)
            }
        })
    }

    pub fn spec(&self) -> AudioSpec {
        self.with(|state| state.spec)
    }

    pub fn is_headless(&self) -> bool {
        self.shared.headless
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }

    /// Mixes `out.len()` samples synchronously. Only for headless mixers; the
    /// calling thread acts as the device thread and must not call this
    /// concurrently with itself.
    pub fn generate(&self, out: &mut [f32]) -> Result<()> {
        if !self.shared.headless {
            return Err(PetalMixError::misuse(
                "Can't generate from a device-bound mixer",
            ));
        }
        let spec = self.with_live(|state| {
            if state.mixing {
                return Err(PetalMixError::misuse("generate called during a mix pass"));
            }
            Ok(state.spec)
        })?;
        if out.len() % spec.frame_len() != 0 {
            return Err(PetalMixError::invalid(format!(
                "Buffer of {} samples doesn't hold whole {}-channel frames",
                out.len(),
                spec.channels
            )));
        }
        self.shared.render(out);
        Ok(())
    }

    /// Changes the output format of a headless mixer.
    pub fn set_output_spec(&self, spec: AudioSpec) -> Result<()> {
        if !self.shared.headless {
            return Err(PetalMixError::misuse(
                "Device-bound mixers follow the device format",
            ));
        }
        self.apply_spec(spec)
    }

    /// Reconfigures every track for a new output format and rebuilds the
    /// panning table when the channel count changes.
    pub(crate) fn apply_spec(&self, spec: AudioSpec) -> Result<()> {
        spec.validate()?;
        let changed = self.with_live(|state| {
            if state.spec == spec {
                return Ok(false);
            }
            if state.spec.channels != spec.channels {
                state.vbap = VbapTable::for_channels(spec.channels).map(Arc::new);
            }
            state.spec = spec;
            for track in state.live_tracks() {
                track.set_mixer_spec(spec)?;
            }
            Ok(true)
        })?;
        if changed {
            log::info!("Mixer output format changed to {}", spec);
            let _ = self
                .shared
                .events_tx
                .try_send(MixerEvent::FormatChanged { spec });
        }
        Ok(())
    }

    pub fn gain(&self) -> f32 {
        self.with(|state| state.gain)
    }

    /// Master gain applied to every track.
    pub fn set_gain(&self, gain: f32) -> Result<()> {
        if !(gain >= 0.0) {
            return Err(PetalMixError::invalid("Gain must be non-negative"));
        }
        self.with_live(|state| {
            state.gain = gain;
            Ok(())
        })
    }

    pub fn set_postmix_callback<F>(&self, callback: Option<F>) -> Result<()>
    where
        F: Fn(&Mixer, &mut [f32], AudioSpec) + Send + Sync + 'static,
    {
        self.with_live(|state| {
            state.postmix = callback.map(|f| Arc::new(f) as PostmixCallback);
            Ok(())
        })
    }

    /// Drains pending events.
    pub fn poll_events(&self) -> Vec<MixerEvent> {
        self.shared.events_rx.try_iter().collect()
    }

    fn insert_track(&self, state: &mut MixerState, fire_and_forget: bool) -> Result<Arc<TrackShared>> {
        let slot = state.free_slots.pop().unwrap_or(state.tracks.len());
        let track = Arc::new(TrackShared::new(
            slot,
            self.downgrade(),
            self.shared.events_tx.clone(),
            state.spec,
            GroupId::DEFAULT,
        )?);
        track.with(|t| {
            t.fire_and_forget = fire_and_forget;
            t.pooled = fire_and_forget;
        });
        if slot == state.tracks.len() {
            state.tracks.push(Some(track.clone()));
        } else {
            state.tracks[slot] = Some(track.clone());
        }
        state.groups.default_group().members.push(track.clone());
        Ok(track)
    }

    pub fn create_track(&self) -> Result<Track> {
        let track = self.with_live(|state| self.insert_track(state, false))?;
        log::debug!("Created {}", track.id());
        Ok(Track::from_shared(track))
    }

    /// Application-created tracks, in creation slot order.
    pub fn tracks(&self) -> Vec<Track> {
        self.with(|state| {
            state
                .live_tracks()
                .filter(|t| !t.with(|s| s.fire_and_forget))
                .cloned()
                .map(Track::from_shared)
                .collect()
        })
    }

    /// Plays `audio` once on an internal track recycled from a pool.
    pub fn play_audio(&self, audio: &Audio) -> Result<()> {
        // Opening may hit the disk; keep it clear of the mix pass
        let decoder = audio.open_track()?;
        let track = {
            let guard = self.shared.state.lock();
            let mut state = guard.borrow_mut();
            if state.destroyed {
                return Err(PetalMixError::Destroyed("Mixer"));
            }
            let mut pooled = None;
            while let Some(slot) = state.pool.pop() {
                pooled = state.track(slot).cloned();
                if pooled.is_some() {
                    break;
                }
            }
            match pooled {
                Some(track) => track,
                None => self.insert_track(&mut state, true)?,
            }
        };

        // Popped tracks stay marked pooled until they play, so a mix pass
        // in between leaves them alone
        let handle = Track::from_shared(track.clone());
        let started = handle
            .bind_audio(audio, decoder)
            .and_then(|()| handle.play(&PlayOptions::new()));
        if let Err(e) = started {
            track.with(|t| t.pooled = true);
            self.with(|state| state.pool.push(track.slot));
            return Err(e);
        }
        log::trace!("Fire-and-forget {} playing {}", track.id(), audio.id());
        Ok(())
    }

    /// Applies `op` to every track (or every track with `tag`) under the
    /// mixer lock, then fires the collected stopped callbacks unlocked.
    fn bulk(
        &self,
        tag: Option<&str>,
        mut op: impl FnMut(&TrackShared) -> Result<Option<StoppedCallback>>,
    ) -> Result<usize> {
        let mut fired = Vec::new();
        let mut first_error = None;
        let mut count = 0;
        {
            let guard = self.shared.state.lock();
            let targets: Vec<Arc<TrackShared>> = {
                let state = guard.borrow();
                if state.destroyed {
                    return Err(PetalMixError::Destroyed("Mixer"));
                }
                match tag {
                    Some(tag) => state.tags.get(tag).cloned().unwrap_or_default(),
                    None => state.live_tracks().cloned().collect(),
                }
            };
            for track in &targets {
                match op(track) {
                    Ok(callback) => {
                        count += 1;
                        if let Some(callback) = callback {
                            fired.push((track.clone(), callback));
                        }
                    }
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        for (track, callback) in fired {
            callback(&Track::from_shared(track));
        }
        first_error.map_or(Ok(count), Err)
    }

    /// Stops every track, fading out over `fade_out_ms` when nonzero.
    pub fn stop_all(&self, fade_out_ms: u64) -> Result<()> {
        self.bulk(None, |t| t.stop(FrameOrMs::Ms(fade_out_ms)))
            .map(|_| ())
    }

    pub fn pause_all(&self) -> Result<()> {
        self.bulk(None, |t| t.set_paused(true).map(|()| None))
            .map(|_| ())
    }

    pub fn resume_all(&self) -> Result<()> {
        self.bulk(None, |t| t.set_paused(false).map(|()| None))
            .map(|_| ())
    }

    /// Starts every track with `tag` together. Returns how many started.
    pub fn play_tag(&self, tag: &str, options: &PlayOptions) -> Result<usize> {
        self.bulk(Some(tag), |t| t.play(options).map(|()| None))
    }

    pub fn stop_tag(&self, tag: &str, fade_out_ms: u64) -> Result<usize> {
        self.bulk(Some(tag), |t| t.stop(FrameOrMs::Ms(fade_out_ms)))
    }

    pub fn pause_tag(&self, tag: &str) -> Result<usize> {
        self.bulk(Some(tag), |t| t.set_paused(true).map(|()| None))
    }

    pub fn resume_tag(&self, tag: &str) -> Result<usize> {
        self.bulk(Some(tag), |t| t.set_paused(false).map(|()| None))
    }

    pub fn set_tag_gain(&self, tag: &str, gain: f32) -> Result<usize> {
        self.bulk(Some(tag), |t| t.set_gain(gain).map(|()| None))
    }

    pub fn tracks_with_tag(&self, tag: &str) -> Vec<Track> {
        self.with(|state| {
            state
                .tags
                .get(tag)
                .into_iter()
                .flatten()
                .cloned()
                .map(Track::from_shared)
                .collect()
        })
    }

    fn check_owned(&self, track: &Track) -> Result<()> {
        if track.shared.belongs_to(&self.shared) {
            Ok(())
        } else {
            Err(PetalMixError::misuse("Track belongs to a different mixer"))
        }
    }

    pub(crate) fn tag_track(&self, track: &Track, tag: &str) -> Result<()> {
        if tag.is_empty() {
            return Err(PetalMixError::invalid("Tag can't be empty"));
        }
        self.check_owned(track)?;
        self.with_live(|state| {
            let added = track
                .shared
                .with(|t| !t.is_destroyed() && t.tags.insert(tag.to_string()));
            if added {
                state
                    .tags
                    .entry(tag.to_string())
                    .or_default()
                    .push(track.shared.clone());
            }
            Ok(())
        })
    }

    pub(crate) fn untag_track(&self, track: &Track, tag: &str) -> Result<()> {
        self.check_owned(track)?;
        self.with_live(|state| {
            if track.shared.with(|t| t.tags.remove(tag)) {
                if let Some(list) = state.tags.get_mut(tag) {
                    list.retain(|t| !Arc::ptr_eq(t, &track.shared));
                    if list.is_empty() {
                        state.tags.remove(tag);
                    }
                }
            }
            Ok(())
        })
    }

    pub fn default_group(&self) -> Group {
        Group::new(self, GroupId::DEFAULT)
    }

    pub fn create_group(&self) -> Result<Group> {
        let id = self.with_live(|state| Ok(state.groups.insert()))?;
        log::debug!("Created group {:?}", id);
        Ok(Group::new(self, id))
    }

    pub fn group_count(&self) -> usize {
        self.with(|state| state.groups.len())
    }

    pub(crate) fn with_group<R>(
        &self,
        id: GroupId,
        f: impl FnOnce(&mut GroupEntry) -> R,
    ) -> Result<R> {
        self.with_live(|state| {
            state
                .groups
                .get_mut(id)
                .map(f)
                .ok_or(PetalMixError::Destroyed("Group"))
        })
    }

    pub(crate) fn move_track(&self, track: &Track, group: &Group) -> Result<()> {
        if !group.belongs_to(&self.shared) {
            return Err(PetalMixError::misuse(
                "Track and group belong to different mixers",
            ));
        }
        self.check_owned(track)?;
        self.with_live(|state| {
            if state.groups.get(group.id()).is_none() {
                return Err(PetalMixError::Destroyed("Group"));
            }
            let old = track.shared.with(|t| {
                if t.is_destroyed() {
                    Err(PetalMixError::Destroyed("Track"))
                } else {
                    Ok(std::mem::replace(&mut t.group, group.id()))
                }
            })?;
            if let Some(entry) = state.groups.get_mut(old) {
                entry.members.retain(|t| !Arc::ptr_eq(t, &track.shared));
            }
            if let Some(entry) = state.groups.get_mut(group.id()) {
                entry.members.push(track.shared.clone());
            }
            Ok(())
        })
    }

    pub(crate) fn destroy_group(&self, id: GroupId) -> Result<()> {
        self.with_live(|state| {
            let entry = state
                .groups
                .remove(id)
                .ok_or(PetalMixError::Destroyed("Group"))?;
            for track in &entry.members {
                track.with(|t| t.group = GroupId::DEFAULT);
            }
            let moved = entry.members.len();
            state.groups.default_group().members.extend(entry.members);
            log::debug!("Destroyed group {:?}, {} tracks moved to default", id, moved);
            Ok(())
        })
    }

    pub(crate) fn destroy_track(&self, track: &Track) {
        let shared = &track.shared;
        if shared.belongs_to(&self.shared) {
            self.with(|state| {
                if state
                    .track(shared.slot)
                    .is_some_and(|t| Arc::ptr_eq(t, shared))
                {
                    state.tracks[shared.slot] = None;
                    state.free_slots.push(shared.slot);
                    state.pool.retain(|&slot| slot != shared.slot);
                }
                let group = shared.with(|t| t.group);
                if let Some(entry) = state.groups.get_mut(group) {
                    entry.members.retain(|t| !Arc::ptr_eq(t, shared));
                }
                state.tags.retain(|_, list| {
                    list.retain(|t| !Arc::ptr_eq(t, shared));
                    !list.is_empty()
                });
            });
        }
        if shared.destroy() {
            log::debug!("Destroyed {}", shared.id());
        }
    }

    pub fn resume_device(&self) -> Result<()> {
        self.device_command(DeviceHandle::resume)
    }

    pub fn pause_device(&self) -> Result<()> {
        self.device_command(DeviceHandle::pause)
    }

    fn device_command(&self, command: impl FnOnce(&DeviceHandle) -> Result<()>) -> Result<()> {
        let device = self.shared.device.lock();
        match device.as_ref() {
            Some(device) => command(device),
            None if self.shared.headless => {
                Err(PetalMixError::misuse("Headless mixers have no device"))
            }
            None => Err(PetalMixError::Destroyed("Mixer")),
        }
    }

    /// Closes the device, then stops and destroys every track and group.
    /// Returns `false` if the mixer was already destroyed.
    pub fn destroy(&self) -> bool {
        let (tracks, mixing) = {
            let guard = self.shared.state.lock();
            let mut state = guard.borrow_mut();
            if state.destroyed {
                return false;
            }
            state.destroyed = true;
            state.groups.clear();
            state.tags.clear();
            state.pool.clear();
            state.free_slots.clear();
            state.postmix = None;
            let tracks: Vec<_> = state.tracks.drain(..).flatten().collect();
            (tracks, state.mixing)
        };

        let device = self.shared.device.lock().take();
        if let Some(device) = device {
            // From inside a mix pass the device thread can't be joined
            device.close(!mixing);
        }
        let count = tracks.len();
        for track in tracks {
            track.destroy();
        }
        log::info!("Mixer destroyed with {} tracks", count);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(spec: AudioSpec) -> (Context, Mixer) {
        let ctx = Context::new();
        ctx.init().unwrap();
        let mixer = Mixer::new(&ctx, spec).unwrap();
        (ctx, mixer)
    }

    fn constant(ctx: &Context, value: f32, frames: usize, spec: AudioSpec) -> Audio {
        ctx.load_raw_audio(&vec![value; frames * spec.frame_len()], spec)
            .unwrap()
    }

    #[test]
    fn test_sums_tracks_with_master_gain() {
        let spec = AudioSpec::new(8000, 2);
        let (ctx, mixer) = setup(spec);
        for value in [0.25, 0.5] {
            let track = mixer.create_track().unwrap();
            track
                .set_audio(Some(&constant(&ctx, value, 100, spec)))
                .unwrap();
            track.play(&PlayOptions::new()).unwrap();
        }
        mixer.set_gain(0.5).unwrap();
        assert!(mixer.set_gain(-0.5).is_err());

        let mut out = [0.0; 8];
        mixer.generate(&mut out).unwrap();
        assert!(out.iter().all(|&s| (s - 0.375).abs() < 1e-6));
        ctx.quit();
    }

    #[test]
    fn test_generate_rejects_partial_frames() {
        let (ctx, mixer) = setup(AudioSpec::new(8000, 2));
        let mut out = [0.0; 3];
        assert!(matches!(
            mixer.generate(&mut out),
            Err(PetalMixError::InvalidParameter(_))
        ));
        ctx.quit();
    }

    #[test]
    fn test_postmix_sees_final_buffer() {
        let spec = AudioSpec::new(8000, 1);
        let (ctx, mixer) = setup(spec);
        let track = mixer.create_track().unwrap();
        track
            .set_audio(Some(&constant(&ctx, 0.5, 100, spec)))
            .unwrap();
        track.play(&PlayOptions::new()).unwrap();
        mixer
            .set_postmix_callback(Some(|_: &Mixer, pcm: &mut [f32], _: AudioSpec| {
                pcm.iter_mut().for_each(|s| *s = -*s);
            }))
            .unwrap();

        let mut out = [0.0; 4];
        mixer.generate(&mut out).unwrap();
        assert_eq!(out, [-0.5; 4]);
        ctx.quit();
    }

    #[test]
    fn test_stereo_spatialization_routes_gains() {
        let spec = AudioSpec::new(8000, 2);
        let (ctx, mixer) = setup(spec);
        let mono = AudioSpec::new(8000, 1);
        let track = mixer.create_track().unwrap();
        track.set_audio(Some(&constant(&ctx, 1.0, 100, mono))).unwrap();
        track.set_stereo(0.25, 0.75).unwrap();
        track.play(&PlayOptions::new()).unwrap();

        let mut out = [0.0; 4];
        mixer.generate(&mut out).unwrap();
        assert_eq!(out, [0.25, 0.75, 0.25, 0.75]);
        ctx.quit();
    }

    #[test]
    fn test_position_ahead_pans_center() {
        let spec = AudioSpec::new(8000, 2);
        let (ctx, mixer) = setup(spec);
        let track = mixer.create_track().unwrap();
        track
            .set_audio(Some(&constant(&ctx, 1.0, 100, AudioSpec::new(8000, 1))))
            .unwrap();
        track
            .set_position_3d(crate::math::Vec3::new(0.0, 0.0, -1.0))
            .unwrap();
        track.play(&PlayOptions::new()).unwrap();

        let mut out = [0.0; 4];
        mixer.generate(&mut out).unwrap();
        assert!((out[0] - out[1]).abs() < 1e-6);
        assert!(out[0] > 0.0);
        ctx.quit();
    }

    #[test]
    fn test_group_destroy_moves_tracks_to_default() {
        let (ctx, mixer) = setup(AudioSpec::new(8000, 2));
        let group = mixer.create_group().unwrap();
        let track = mixer.create_track().unwrap();
        track.set_group(&group).unwrap();
        assert_eq!(track.group().unwrap(), group);
        assert_eq!(group.tracks().unwrap(), vec![track.clone()]);

        assert!(mixer.default_group().destroy().is_err());
        group.destroy().unwrap();
        assert!(track.group().unwrap().is_default());
        assert!(matches!(group.tracks(), Err(PetalMixError::Destroyed("Group"))));
        assert_eq!(mixer.group_count(), 1);
        ctx.quit();
    }

    #[test]
    fn test_cross_mixer_group_rejected() {
        let ctx = Context::new();
        ctx.init().unwrap();
        let a = Mixer::new(&ctx, AudioSpec::new(8000, 2)).unwrap();
        let b = Mixer::new(&ctx, AudioSpec::new(8000, 2)).unwrap();
        let track = a.create_track().unwrap();
        let group = b.create_group().unwrap();
        assert!(matches!(
            track.set_group(&group),
            Err(PetalMixError::Misuse(_))
        ));
        ctx.quit();
    }

    #[test]
    fn test_tags_drive_bulk_operations() {
        let spec = AudioSpec::new(8000, 1);
        let (ctx, mixer) = setup(spec);
        let audio = constant(&ctx, 0.5, 100, spec);
        let tagged = mixer.create_track().unwrap();
        let other = mixer.create_track().unwrap();
        for track in [&tagged, &other] {
            track.set_audio(Some(&audio)).unwrap();
        }
        tagged.tag("music").unwrap();
        tagged.tag("music").unwrap();
        assert_eq!(mixer.tracks_with_tag("music"), vec![tagged.clone()]);
        assert_eq!(tagged.tags(), vec!["music".to_string()]);

        assert_eq!(mixer.play_tag("music", &PlayOptions::new()).unwrap(), 1);
        assert!(tagged.is_playing());
        assert!(!other.is_playing());

        mixer.set_tag_gain("music", 0.0).unwrap();
        assert_eq!(tagged.gain(), 0.0);
        mixer.stop_tag("music", 0).unwrap();
        assert!(!tagged.is_playing());

        tagged.untag("music").unwrap();
        assert!(mixer.tracks_with_tag("music").is_empty());
        assert_eq!(mixer.play_tag("music", &PlayOptions::new()).unwrap(), 0);
        ctx.quit();
    }

    #[test]
    fn test_fire_and_forget_pool_reuses_tracks() {
        let spec = AudioSpec::new(8000, 1);
        let (ctx, mixer) = setup(spec);
        let audio = constant(&ctx, 0.5, 4, spec);
        mixer.play_audio(&audio).unwrap();
        assert!(mixer.tracks().is_empty());
        assert_eq!(audio.ref_count(), 2);

        let mut out = [0.0; 8];
        mixer.generate(&mut out).unwrap();
        assert_eq!(&out[..4], &[0.5; 4]);
        assert_eq!(audio.ref_count(), 1);

        mixer.play_audio(&audio).unwrap();
        mixer.generate(&mut out).unwrap();
        let slots = mixer.with(|state| state.live_tracks().count());
        assert_eq!(slots, 1);
        ctx.quit();
    }

    #[test]
    fn test_unplayed_pool_track_survives_mix_pass() {
        let spec = AudioSpec::new(8000, 1);
        let (ctx, mixer) = setup(spec);
        let audio = constant(&ctx, 0.5, 4, spec);

        // play_audio binds outside the mixer lock, so a pass may run first
        let track = mixer.with(|state| mixer.insert_track(state, true)).unwrap();
        let mut out = [0.0; 4];
        mixer.generate(&mut out).unwrap();
        assert!(mixer.with(|state| state.pool.is_empty()));

        let handle = Track::from_shared(track.clone());
        handle.bind_audio(&audio, audio.open_track().unwrap()).unwrap();
        handle.play(&PlayOptions::new()).unwrap();
        mixer.generate(&mut out).unwrap();
        assert_eq!(out, [0.5; 4]);
        assert_eq!(mixer.with(|state| state.pool.clone()), vec![track.slot]);
        ctx.quit();
    }

    #[test]
    fn test_output_spec_change_reconfigures() {
        let spec = AudioSpec::new(8000, 2);
        let (ctx, mixer) = setup(spec);
        let track = mixer.create_track().unwrap();
        track.set_audio(Some(&constant(&ctx, 0.5, 100, spec))).unwrap();
        track.play(&PlayOptions::new()).unwrap();

        mixer.set_output_spec(AudioSpec::new(8000, 4)).unwrap();
        let mut out = [0.0; 8];
        mixer.generate(&mut out).unwrap();
        assert_eq!(out, [0.5, 0.5, 0.0, 0.0, 0.5, 0.5, 0.0, 0.0]);
        assert!(
            mixer
                .poll_events()
                .iter()
                .any(|e| matches!(e, MixerEvent::FormatChanged { spec } if spec.channels == 4))
        );
        ctx.quit();
    }

    #[test]
    fn test_destroyed_mixer_rejects_calls() {
        let (ctx, mixer) = setup(AudioSpec::new(8000, 2));
        let track = mixer.create_track().unwrap();
        assert!(mixer.destroy());
        assert!(!mixer.destroy());
        assert!(track.is_destroyed());
        assert!(matches!(
            mixer.create_track(),
            Err(PetalMixError::Destroyed("Mixer"))
        ));
        assert!(matches!(
            mixer.pause_device(),
            Err(PetalMixError::Misuse(_))
        ));
        ctx.quit();
    }
}
