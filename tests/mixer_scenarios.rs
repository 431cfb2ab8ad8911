use anyhow::Result;
use petalmix::decoder::{
    DecodeStatus, Decoder, DecoderAudio, DecoderInput, ProbedAudio, RAW_CHANNELS,
    RAW_SAMPLE_RATE, TrackDecoder, samples_to_bytes,
};
use petalmix::spatial::{VbapTable, VectorBackend};
use petalmix::{
    AudioDecoder, AudioDuration, AudioSpec, AudioStream, Context, FrameOrMs, Group, LiveCounts,
    LoadOptions, Mixer, MixerEvent, PlayOptions, PlayState, Properties, PropertyValue, Track, Vec3,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn context() -> Result<Context> {
    init_logger();
    let ctx = Context::new();
    ctx.init()?;
    Ok(ctx)
}

/// Generates `frames` frames in blocks of `block` frames.
fn pull(mixer: &Mixer, frames: usize, block: usize) -> Result<Vec<f32>> {
    let channels = mixer.spec().frame_len();
    let mut out = vec![0.0; frames * channels];
    for chunk in out.chunks_mut(block * channels) {
        mixer.generate(chunk)?;
    }
    Ok(out)
}

#[test]
fn test_silent_second_stops_on_time() -> Result<()> {
    let ctx = context()?;
    let spec = AudioSpec::new(48000, 2);
    let mixer = Mixer::new(&ctx, spec)?;
    let audio = ctx.load_raw_audio(&vec![0.0; 48000 * 2], spec)?;
    assert_eq!(audio.duration(), AudioDuration::Known(48000));

    let track = mixer.create_track()?;
    track.set_audio(Some(&audio))?;
    track.play(&PlayOptions::new())?;

    let out = pull(&mixer, 48000, 480)?;
    assert_eq!(track.state(), PlayState::Stopped);
    assert!(out.iter().all(|&s| s == 0.0));
    assert!(
        mixer
            .poll_events()
            .contains(&MixerEvent::TrackStopped { track: track.id() })
    );
    ctx.quit();
    Ok(())
}

#[test]
fn test_fade_in_halfway_gain() -> Result<()> {
    let ctx = context()?;
    let spec = AudioSpec::new(48000, 1);
    let mixer = Mixer::new(&ctx, spec)?;
    let audio = ctx.load_raw_audio(&vec![1.0; 48000 * 2], spec)?;
    let track = mixer.create_track()?;
    track.set_audio(Some(&audio))?;
    track.play(&PlayOptions::new().fade_in(FrameOrMs::Ms(1000)))?;

    let out = pull(&mixer, 50000, 1000)?;
    assert!((out[24000] - 0.5).abs() < 1e-6);
    assert_eq!(out[0], 0.0);
    assert!(out[..48000].windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(out[48000], 1.0);
    ctx.quit();
    Ok(())
}

#[test]
fn test_group_postmix_is_isolated() -> Result<()> {
    let ctx = context()?;
    let spec = AudioSpec::new(8000, 2);
    let mixer = Mixer::new(&ctx, spec)?;

    let muted = mixer.create_group()?;
    let open = mixer.create_group()?;
    muted.set_postmix_callback(Some(|_: &Group, pcm: &mut [f32], _: AudioSpec| {
        pcm.fill(0.0)
    }))?;

    let loud = ctx.load_raw_audio(&[0.75; 200], spec)?;
    let quiet = ctx.load_raw_audio(&[0.25; 200], spec)?;
    for (group, audio) in [(&muted, &loud), (&open, &quiet)] {
        let track = mixer.create_track()?;
        track.set_audio(Some(audio))?;
        track.set_group(group)?;
        track.play(&PlayOptions::new())?;
    }

    let out = pull(&mixer, 64, 64)?;
    assert!(out.iter().all(|&s| s == 0.25));
    ctx.quit();
    Ok(())
}

#[test]
fn test_group_postmix_gets_full_window() -> Result<()> {
    let ctx = context()?;
    let spec = AudioSpec::new(8000, 1);
    let mixer = Mixer::new(&ctx, spec)?;
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    mixer
        .default_group()
        .set_postmix_callback(Some(move |_: &Group, pcm: &mut [f32], _: AudioSpec| {
            counter.store(pcm.len(), Ordering::SeqCst);
        }))?;

    let track = mixer.create_track()?;
    track.set_audio(Some(&ctx.load_raw_audio(&[0.5; 10], spec)?))?;
    track.play(&PlayOptions::new())?;
    let out = pull(&mixer, 32, 32)?;
    assert_eq!(seen.load(Ordering::SeqCst), 32);
    assert_eq!(&out[..10], &[0.5; 10]);
    assert!(out[10..].iter().all(|&s| s == 0.0));
    ctx.quit();
    Ok(())
}

#[test]
fn test_quad_vbap_on_speaker() -> Result<()> {
    let table = VbapTable::for_channels(4).expect("quad layout");
    let (gains, channels) = table.pan((-45f32).to_radians(), 1.0);
    for (gain, channel) in gains.iter().zip(channels) {
        if channel == 0 {
            assert!((gain - 1.0).abs() < 1e-4);
        } else {
            assert!(gain.abs() < 1e-4);
        }
    }

    // Same source through a quad mixer, one unit from the listener
    let ctx = context()?;
    let mixer = Mixer::new(&ctx, AudioSpec::new(8000, 4))?;
    let audio = ctx.load_raw_audio(&[1.0; 100], AudioSpec::new(8000, 1))?;
    let track = mixer.create_track()?;
    track.set_audio(Some(&audio))?;
    let angle = (-45f32).to_radians();
    track.set_position_3d(Vec3::new(angle.sin(), 0.0, -angle.cos()))?;
    track.play(&PlayOptions::new())?;

    let out = pull(&mixer, 8, 8)?;
    for frame in out.chunks_exact(4) {
        assert!((frame[0] - 1.0).abs() < 1e-4);
        assert!(frame[1..].iter().all(|s| s.abs() < 1e-4));
    }
    ctx.quit();
    Ok(())
}

#[test]
fn test_spatial_degenerate_positions() {
    let (angle, distance) = VectorBackend::Scalar.angle_and_distance(Vec3::Y);
    assert_eq!(angle, 0.0);
    assert_eq!(distance, 1.0);

    let (angle, _) = VectorBackend::detect().angle_and_distance(Vec3::new(0.0, 0.0, -3.0));
    assert!(angle.abs() < 1e-6);
}

#[test]
fn test_quit_destroys_everything_live() -> Result<()> {
    let ctx = context()?;
    let mixers = (0..2)
        .map(|_| Mixer::new(&ctx, AudioSpec::new(8000, 2)))
        .collect::<petalmix::Result<Vec<_>>>()?;
    let audios = (0..3)
        .map(|_| ctx.create_sine_wave_audio(440.0, 0.1))
        .collect::<petalmix::Result<Vec<_>>>()?;
    let options = LoadOptions::new()
        .property(RAW_SAMPLE_RATE, PropertyValue::Number(8000))
        .property(RAW_CHANNELS, PropertyValue::Number(1));
    let decoder = AudioDecoder::open_memory(&ctx, samples_to_bytes(&[0.0; 16]), &options)?;

    assert_eq!(
        ctx.live_counts(),
        LiveCounts {
            mixers: 2,
            audios: 3,
            audio_decoders: 1
        }
    );
    let destroyed = ctx.quit();
    assert_eq!(destroyed.total(), 6);
    assert_eq!(destroyed.mixers, 2);
    assert_eq!(destroyed.audios, 3);
    assert_eq!(destroyed.audio_decoders, 1);
    assert_eq!(ctx.live_counts(), LiveCounts::default());
    assert!(mixers.iter().all(Mixer::is_destroyed));
    assert!(audios.iter().all(|a| a.is_destroyed()));
    assert!(decoder.is_destroyed());

    ctx.init()?;
    assert_eq!(ctx.quit(), LiveCounts::default());
    Ok(())
}

struct Counting {
    released: Arc<AtomicUsize>,
}

struct CountingAudio {
    released: Arc<AtomicUsize>,
}

impl Drop for CountingAudio {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct SilenceCursor {
    left: u64,
}

impl Decoder for Counting {
    fn name(&self) -> &'static str {
        "COUNTING"
    }

    fn probe(
        &self,
        _: &DecoderInput<'_>,
        _: &mut Properties,
    ) -> petalmix::Result<Option<ProbedAudio>> {
        Ok(Some(ProbedAudio {
            spec: AudioSpec::new(8000, 1),
            duration: AudioDuration::Known(64),
            state: Box::new(CountingAudio {
                released: self.released.clone(),
            }),
        }))
    }
}

impl DecoderAudio for CountingAudio {
    fn open_track(&self, _: &DecoderInput<'_>) -> petalmix::Result<Box<dyn TrackDecoder>> {
        Ok(Box::new(SilenceCursor { left: 64 }))
    }
}

impl TrackDecoder for SilenceCursor {
    fn decode(&mut self, out: &mut AudioStream) -> DecodeStatus {
        if self.left == 0 {
            return DecodeStatus::EndOfStream;
        }
        let frames = self.left.min(16);
        self.left -= frames;
        match out.put(&vec![0.0; frames as usize]) {
            Ok(()) => DecodeStatus::More,
            Err(e) => DecodeStatus::Error(e.to_string()),
        }
    }

    fn seek(&mut self, frame: u64) -> petalmix::Result<()> {
        self.left = 64u64.saturating_sub(frame);
        Ok(())
    }
}

#[test]
fn test_audio_released_once_after_last_track() -> Result<()> {
    let ctx = context()?;
    let released = Arc::new(AtomicUsize::new(0));
    ctx.add_decoder(Arc::new(Counting {
        released: released.clone(),
    }))?;
    let mixer = Mixer::new(&ctx, AudioSpec::new(8000, 1))?;
    let audio = ctx.load_audio_from_memory(vec![0u8; 8], &LoadOptions::new().decoder("COUNTING"))?;

    let tracks = (0..4)
        .map(|_| -> Result<Track> {
            let track = mixer.create_track()?;
            track.set_audio(Some(&audio))?;
            track.play(&PlayOptions::new())?;
            Ok(track)
        })
        .collect::<Result<Vec<_>>>()?;
    drop(audio);
    pull(&mixer, 32, 32)?;

    for index in [2, 0, 3] {
        tracks[index].destroy();
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }
    tracks[1].destroy();
    assert_eq!(released.load(Ordering::SeqCst), 1);

    ctx.quit();
    assert_eq!(released.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_loop_total_frames() -> Result<()> {
    let ctx = context()?;
    let spec = AudioSpec::new(8000, 1);
    let mixer = Mixer::new(&ctx, spec)?;
    let samples: Vec<f32> = (0..100).map(|i| (i + 1) as f32 / 1000.0).collect();
    let audio = ctx.load_raw_audio(&samples, spec)?;
    let track = mixer.create_track()?;
    track.set_audio(Some(&audio))?;
    track.play(
        &PlayOptions::new()
            .loops(2)
            .loop_start(FrameOrMs::Frames(30)),
    )?;
    assert_eq!(track.remaining_frames(), Some(240));

    let out = pull(&mixer, 400, 64)?;
    let produced = out.iter().take_while(|&&s| s != 0.0).count();
    assert_eq!(produced, 30 + 3 * 70);
    assert!(out[produced..].iter().all(|&s| s == 0.0));
    assert_eq!(out[99], 0.1);
    assert_eq!(out[100], 0.031);
    assert_eq!(out[239], 0.1);
    assert_eq!(track.state(), PlayState::Stopped);

    let loops: Vec<i64> = mixer
        .poll_events()
        .into_iter()
        .filter_map(|event| match event {
            MixerEvent::TrackLooped {
                loops_remaining, ..
            } => Some(loops_remaining),
            _ => None,
        })
        .collect();
    assert_eq!(loops, vec![1, 0]);
    ctx.quit();
    Ok(())
}

#[test]
fn test_stop_and_seek_contracts() -> Result<()> {
    let ctx = context()?;
    let spec = AudioSpec::new(8000, 1);
    let mixer = Mixer::new(&ctx, spec)?;
    let track = mixer.create_track()?;
    track.stop(0)?;
    track.stop(100)?;

    track.set_audio(Some(&ctx.load_raw_audio(&[0.5; 1000], spec)?))?;
    for frame in [0, 17, 999] {
        track.seek(frame)?;
        assert_eq!(track.position(), frame);
    }

    track.play(&PlayOptions::new())?;
    track.stop(4)?;
    let out = pull(&mixer, 8, 8)?;
    assert_eq!(out[0], 0.5);
    assert!(out[..4].windows(2).all(|w| w[0] >= w[1]));
    assert!(out[4..].iter().all(|&s| s == 0.0));
    assert_eq!(track.state(), PlayState::Stopped);
    ctx.quit();
    Ok(())
}

#[test]
fn test_generate_rejected_before_init_and_after_destroy() -> Result<()> {
    init_logger();
    let ctx = Context::new();
    assert!(Mixer::new(&ctx, AudioSpec::new(8000, 2)).is_err());

    ctx.init()?;
    let mixer = Mixer::new(&ctx, AudioSpec::new(8000, 2))?;
    mixer.destroy();
    let mut out = [0.0; 4];
    assert!(mixer.generate(&mut out).is_err());
    ctx.quit();
    Ok(())
}

#[test]
fn test_global_context() -> Result<()> {
    init_logger();
    petalmix::init()?;
    let mixer = Mixer::new(petalmix::context(), AudioSpec::new(8000, 1))?;
    let audio = petalmix::context().load_raw_audio(&[0.5; 8], AudioSpec::new(8000, 1))?;
    mixer.play_audio(&audio)?;
    let out = pull(&mixer, 8, 8)?;
    assert_eq!(out, vec![0.5; 8]);

    let destroyed = petalmix::quit();
    assert_eq!(destroyed.mixers, 1);
    assert!(!petalmix::context().is_initialized());
    Ok(())
}
