//! WAV, FLAC, Vorbis, MP3 and friends through symphonia.

use super::loop_points::{LoopAction, LoopPoints, LoopTracker};
use super::{DecodeStatus, Decoder, DecoderAudio, DecoderInput, ProbedAudio, TrackDecoder};
use crate::audio_data::AudioDuration;
use crate::config::AudioSpec;
use crate::error::{PetalMixError, Result};
use crate::properties::Properties;
use crate::stream::AudioStream;
use symphonia::{
    core::{
        audio::SampleBuffer,
        codecs::{self, DecoderOptions},
        errors::Error,
        formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
        io::MediaSourceStream,
        meta::{MetadataOptions, MetadataRevision},
        probe::Hint,
        units::TimeBase,
    },
    default::{get_codecs, get_probe},
};

/// Set to `true` to play files with loop tags straight through.
pub const IGNORE_LOOP_TAGS: &str = "symphonia.ignore_loop_tags";

#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoder;

struct Opened {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn codecs::Decoder>,
    track_id: u32,
    spec: AudioSpec,
    time_base: Option<TimeBase>,
    n_frames: Option<u64>,
}

fn open(input: &DecoderInput<'_>, props: Option<&mut Properties>) -> Result<Option<Opened>> {
    let Some(reader) = input.open()? else {
        return Ok(None);
    };
    let mss = MediaSourceStream::new(Box::new(reader), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = input.extension() {
        hint.with_extension(ext);
    }

    let mut probed = match get_probe().format(
        &hint,
        mss,
        &FormatOptions {
            enable_gapless: true,
            ..Default::default()
        },
        &MetadataOptions::default(),
    ) {
        Ok(probed) => probed,
        Err(e) => {
            log::debug!("Symphonia probe failed: {}", e);
            return Ok(None);
        }
    };

    if let Some(props) = props {
        if let Some(revision) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
            collect_tags(revision, props);
        }
        if let Some(revision) = probed.format.metadata().current() {
            collect_tags(revision, props);
        }
    }

    let format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| PetalMixError::Decoder("No default audio track found".to_string()))?;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| PetalMixError::Decoder("Sample rate not found".to_string()))?;
    let channels = track
        .codec_params
        .channels
        .ok_or_else(|| PetalMixError::Decoder("Channel count not found".to_string()))?
        .count() as u16;
    let spec = AudioSpec::new(sample_rate, channels);
    spec.validate()?;

    let decoder = get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| PetalMixError::Decoder(format!("Failed to create decoder: {}", e)))?;

    Ok(Some(Opened {
        track_id: track.id,
        time_base: track.codec_params.time_base,
        n_frames: track.codec_params.n_frames,
        spec,
        decoder,
        format,
    }))
}

fn collect_tags(revision: &MetadataRevision, props: &mut Properties) {
    for tag in revision.tags() {
        let key = tag.key.trim();
        if key.is_empty() {
            continue;
        }
        // Vorbis comments are case-insensitive; loop tags are looked up upper-case
        props.set_string(key.to_ascii_uppercase(), tag.value.to_string());
    }
}

impl Decoder for SymphoniaDecoder {
    fn name(&self) -> &'static str {
        "SYMPHONIA"
    }

    fn probe(
        &self,
        input: &DecoderInput<'_>,
        props: &mut Properties,
    ) -> Result<Option<ProbedAudio>> {
        let Some(opened) = open(input, Some(props))? else {
            return Ok(None);
        };

        let loop_points = if props.bool(IGNORE_LOOP_TAGS).unwrap_or(false) {
            None
        } else {
            LoopPoints::from_properties(props, opened.n_frames)
        };

        let duration = match (opened.n_frames, loop_points) {
            (Some(frames), Some(points)) => match points.logical_len(frames) {
                Some(len) => AudioDuration::Known(len),
                None => AudioDuration::Infinite,
            },
            (None, Some(points)) if points.is_infinite() => AudioDuration::Infinite,
            (Some(frames), None) => AudioDuration::Known(frames),
            (None, _) => AudioDuration::Unknown,
        };

        log::debug!(
            "Symphonia opened {} ({:?}, loop: {:?})",
            opened.spec,
            duration,
            loop_points
        );

        Ok(Some(ProbedAudio {
            spec: opened.spec,
            duration,
            state: Box::new(SymphoniaAudio {
                spec: opened.spec,
                loop_points,
            }),
        }))
    }
}

struct SymphoniaAudio {
    spec: AudioSpec,
    loop_points: Option<LoopPoints>,
}

impl DecoderAudio for SymphoniaAudio {
    fn open_track(&self, input: &DecoderInput<'_>) -> Result<Box<dyn TrackDecoder>> {
        let opened = open(input, None)?
            .ok_or_else(|| PetalMixError::Decoder("Content no longer probes".into()))?;
        if opened.spec != self.spec {
            return Err(PetalMixError::Decoder(format!(
                "Content changed format ({} != {})",
                opened.spec, self.spec
            )));
        }
        Ok(Box::new(SymphoniaTrack {
            format: opened.format,
            decoder: opened.decoder,
            track_id: opened.track_id,
            time_base: opened.time_base,
            spec: self.spec,
            sample_buf: None,
            skip_frames: 0,
            source_frame: 0,
            looping: self.loop_points.map(LoopTracker::new),
        }))
    }
}

struct SymphoniaTrack {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn codecs::Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    spec: AudioSpec,
    sample_buf: Option<SampleBuffer<f32>>,
    /// Frames to discard after an inexact seek
    skip_frames: u64,
    /// Source frame of the next decoded sample
    source_frame: u64,
    looping: Option<LoopTracker>,
}

impl SymphoniaTrack {
    // Integer conversions so frame-exact containers round-trip exactly
    fn ts_to_frames(&self, ts: u64) -> u64 {
        match self.time_base {
            Some(tb) => {
                (ts as u128 * tb.numer as u128 * self.spec.sample_rate as u128 / tb.denom as u128)
                    as u64
            }
            None => ts,
        }
    }

    fn frames_to_ts(&self, frame: u64) -> u64 {
        match self.time_base {
            Some(tb) => {
                (frame as u128 * tb.denom as u128
                    / (tb.numer as u128 * self.spec.sample_rate as u128)) as u64
            }
            None => frame,
        }
    }

    fn seek_source(&mut self, frame: u64) -> Result<()> {
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts: self.frames_to_ts(frame),
                    track_id: self.track_id,
                },
            )
            .map_err(|e| PetalMixError::Decoder(format!("Seek failed: {}", e)))?;
        self.decoder.reset();

        let actual = self.ts_to_frames(seeked.actual_ts);
        self.skip_frames = frame.saturating_sub(actual);
        self.source_frame = frame;
        Ok(())
    }
}

impl TrackDecoder for SymphoniaTrack {
    fn decode(&mut self, out: &mut AudioStream) -> DecodeStatus {
        let channels = self.spec.frame_len();
        loop {
            // Read the next packet from the container
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(Error::IoError(_)) => return DecodeStatus::EndOfStream,
                Err(Error::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return DecodeStatus::Error(format!("Error reading packet: {}", e)),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(Error::IoError(_)) => return DecodeStatus::EndOfStream,
                Err(Error::DecodeError(e)) => {
                    log::warn!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => return DecodeStatus::Error(format!("Error decoding packet: {}", e)),
            };

            if decoded.spec().channels.count() != channels {
                return DecodeStatus::Error("Channel count changed mid-stream".to_string());
            }

            let needed = decoded.capacity();
            let reuse = self
                .sample_buf
                .as_ref()
                .is_some_and(|buf| buf.capacity() >= needed * channels);
            if !reuse {
                self.sample_buf = Some(SampleBuffer::<f32>::new(needed as u64, *decoded.spec()));
            }
            let Some(buf) = self.sample_buf.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);

            let samples = buf.samples();
            let frames = (samples.len() / channels) as u64;
            let skip = self.skip_frames.min(frames);
            self.skip_frames -= skip;
            if skip == frames {
                continue;
            }
            let chunk_frames = frames - skip;

            let (keep, action) = match self.looping.as_mut() {
                Some(tracker) => tracker.advance(self.source_frame, chunk_frames),
                None => (chunk_frames, LoopAction::Continue),
            };

            let start = skip as usize * channels;
            let end = start + keep as usize * channels;
            if let Err(e) = out.put(&samples[start..end]) {
                return DecodeStatus::Error(e.to_string());
            }
            self.source_frame += keep;

            if let LoopAction::SeekSource(frame) = action {
                log::trace!("Loop boundary reached, back to frame {}", frame);
                if let Err(e) = self.seek_source(frame) {
                    return DecodeStatus::Error(e.to_string());
                }
            }
            return DecodeStatus::More;
        }
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        let source = match self.looping.as_mut() {
            Some(tracker) => tracker.seek(frame),
            None => frame,
        };
        self.seek_source(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_data::{ByteRange, ByteSource};

    /// Minimal 16-bit PCM WAV file.
    pub(crate) fn wav_bytes(rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * channels as u32 * 2).to_le_bytes());
        out.extend_from_slice(&(channels * 2).to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_rejects_garbage() {
        let source = ByteSource::from_bytes(vec![0x42u8; 512]);
        let input = DecoderInput::new(Some(&source), ByteRange::FULL);
        assert!(
            SymphoniaDecoder
                .probe(&input, &mut Properties::new())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_wav_decode_and_seek() {
        let samples: Vec<i16> = (0..4000).map(|i| (i % 100) as i16 * 100).collect();
        let source = ByteSource::from_bytes(wav_bytes(8000, 1, &samples));
        let input = DecoderInput::new(Some(&source), ByteRange::FULL);

        let probed = SymphoniaDecoder
            .probe(&input, &mut Properties::new())
            .unwrap()
            .unwrap();
        assert_eq!(probed.spec, AudioSpec::new(8000, 1));
        assert_eq!(probed.duration, AudioDuration::Known(4000));

        let mut track = probed.state.open_track(&input).unwrap();
        let mut out = AudioStream::passthrough(probed.spec).unwrap();
        while track.decode(&mut out).has_more() {}
        assert_eq!(out.available_frames(), 4000);

        out.clear();
        track.seek(1050).unwrap();
        assert!(track.decode(&mut out).has_more());
        let mut first = [0.0f32; 1];
        out.get(&mut first);
        let expected = (50 * 100) as f32 / 32768.0;
        assert!((first[0] - expected).abs() < 1e-4, "{}", first[0]);
    }

    #[test]
    fn test_loop_tags_extend_duration() {
        let samples = vec![1000i16; 1000];
        let source = ByteSource::from_bytes(wav_bytes(8000, 1, &samples));
        let input = DecoderInput::new(Some(&source), ByteRange::FULL);

        let mut props = Properties::new();
        props.set_number("LOOPSTART", 200);
        props.set_number("LOOPLENGTH", 500);
        props.set_number("LOOPCOUNT", 2);
        let probed = SymphoniaDecoder.probe(&input, &mut props).unwrap().unwrap();
        assert_eq!(probed.duration, AudioDuration::Known(1500));

        let mut track = probed.state.open_track(&input).unwrap();
        let mut out = AudioStream::passthrough(probed.spec).unwrap();
        while track.decode(&mut out).has_more() {}
        assert_eq!(out.available_frames(), 1500);
    }
}
