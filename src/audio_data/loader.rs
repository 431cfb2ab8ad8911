//! The one load routine behind every `Context::load_*` entry point.

use super::{Audio, AudioDuration, ByteRange, ByteSource, LoadOptions};
use crate::context::Context;
use crate::decoder::{DECODER_PROPERTY, DecodeStatus, DecoderInput, RawAudio, samples_to_bytes};
use crate::error::{PetalMixError, Result};
use crate::stream::AudioStream;

/// Scans tags, probes decoders, optionally predecodes or copies the bytes
/// into memory, and registers the result with `ctx` when `register` is set.
pub(crate) fn load(
    ctx: &Context,
    source: Option<ByteSource>,
    options: &LoadOptions,
    register: bool,
) -> Result<Audio> {
    let (decoders, tag_parsers) = ctx.load_plugins()?;

    let mut props = options.properties.clone();
    let mut range = ByteRange::FULL;

    if let Some(src) = source.as_ref().filter(|_| !options.skip_tags) {
        for parser in &tag_parsers {
            match parser.parse(src, &mut range, &mut props) {
                Ok(true) => log::debug!("{} tags narrowed content to {:?}", parser.name(), range),
                Ok(false) => {}
                // Partial tag failures never abort a load
                Err(e) => log::warn!("{} tag scan failed: {}", parser.name(), e),
            }
        }
    }

    let forced = options
        .decoder
        .clone()
        .or_else(|| props.string(DECODER_PROPERTY).map(str::to_string));
    let candidates: Vec<_> = decoders
        .iter()
        .filter(|d| {
            forced
                .as_deref()
                .is_none_or(|name| d.name().eq_ignore_ascii_case(name))
        })
        .collect();
    if candidates.is_empty() {
        return Err(PetalMixError::invalid(format!(
            "Unknown or unavailable decoder {:?}",
            forced.unwrap_or_default()
        )));
    }

    let input = DecoderInput::new(source.as_ref(), range);
    let mut accepted = None;
    for decoder in candidates {
        // Probes only see a scratch copy so a failed probe leaves no trace
        let mut scratch = props.clone();
        match decoder.probe(&input, &mut scratch) {
            Ok(Some(probed)) => {
                log::debug!("{} accepted content ({})", decoder.name(), probed.spec);
                props = scratch;
                accepted = Some((decoder.name(), probed));
                break;
            }
            Ok(None) => continue,
            Err(e) if forced.is_some() => return Err(e),
            Err(e) => log::debug!("{} probe failed: {}", decoder.name(), e),
        }
    }
    let Some((mut decoder_name, probed)) = accepted else {
        return Err(PetalMixError::UnsupportedFormat(
            "No decoder recognized the content".to_string(),
        ));
    };

    let spec = probed.spec;
    let mut duration = probed.duration;
    let mut state = probed.state;
    let mut source = source;

    if options.predecode && duration.is_infinite() {
        log::warn!("Not predecoding content of infinite length");
    } else if options.predecode {
        let input = DecoderInput::new(source.as_ref(), range);
        let mut track = state.open_track(&input)?;
        let mut stream = AudioStream::passthrough(spec)?;
        let mut samples = Vec::new();
        loop {
            let status = track.decode(&mut stream);
            let start = samples.len();
            samples.resize(start + stream.available_frames() * spec.frame_len(), 0.0);
            stream.get(&mut samples[start..]);
            match status {
                DecodeStatus::More => {}
                DecodeStatus::EndOfStream => break,
                DecodeStatus::Error(e) => return Err(PetalMixError::Decoder(e)),
            }
        }
        drop(track);

        let frames = (samples.len() / spec.frame_len()) as u64;
        log::debug!("Predecoded {} frames from {}", frames, decoder_name);
        source = Some(ByteSource::from_bytes(samples_to_bytes(&samples)));
        range = ByteRange::FULL;
        state = Box::new(RawAudio::new(spec));
        decoder_name = "RAW";
        duration = AudioDuration::Known(frames);
    } else if !options.ondemand {
        if let Some(src @ ByteSource::File(_)) = source.as_ref() {
            source = Some(ByteSource::Memory(src.slurp(range)?));
            range = ByteRange::FULL;
        }
    }

    let audio = Audio::new(spec, duration, decoder_name, props, state, source, range);
    log::info!(
        "Loaded {} ({}, {:?}, decoder {})",
        audio.id(),
        spec,
        duration,
        decoder_name
    );
    if register {
        ctx.register_audio(&audio);
    }
    Ok(audio)
}
