//! Output device driver.
//!
//! `cpal::Stream` is not `Send` on every backend, so each device mixer gets
//! an owner thread that builds the stream, keeps it alive and services
//! pause/resume/close commands. The stream's data callback pulls from the
//! mixer and converts to the device's sample format. When the device goes
//! away the owner thread reopens the default device, renegotiating the
//! format if it has to.

use crate::config::{AudioSpec, MixerDesc};
use crate::error::{PetalMixError, Result};
use crate::events::MixerEvent;
use crate::mixer::{Mixer, MixerShared};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Weak;
use std::thread::JoinHandle;

enum DeviceCommand {
    Pause,
    Resume,
    /// Raised by the stream's error callback
    Lost(String),
    Close,
}

/// Handle to a running device owner thread.
pub(crate) struct DeviceHandle {
    commands: Sender<DeviceCommand>,
    thread: Option<JoinHandle<()>>,
    spec: AudioSpec,
}

impl DeviceHandle {
    /// Format negotiated when the device was opened.
    pub fn spec(&self) -> AudioSpec {
        self.spec
    }

    pub fn pause(&self) -> Result<()> {
        self.send(DeviceCommand::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(DeviceCommand::Resume)
    }

    fn send(&self, command: DeviceCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| PetalMixError::AudioDevice("Device thread has exited".into()))
    }

    /// Stops the stream. `join` must be false when called from a mix pass,
    /// which runs on a thread the owner is waiting on.
    pub fn close(mut self, join: bool) {
        let _ = self.commands.send(DeviceCommand::Close);
        if let Some(thread) = self.thread.take() {
            if join && thread.join().is_err() {
                log::error!("Device thread panicked");
            }
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.commands.send(DeviceCommand::Close);
        }
    }
}

/// Opens the default output device and starts pulling from `mixer`.
/// Blocks until the stream is running or has failed to open.
pub(crate) fn open(
    mixer: Weak<MixerShared>,
    desc: &MixerDesc,
    events: Sender<MixerEvent>,
) -> Result<DeviceHandle> {
    let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
    let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
    let lost_tx = commands_tx.clone();
    let desc = desc.clone();

    let thread = std::thread::Builder::new()
        .name("petalmix-device".into())
        .spawn(move || {
            let owner = DeviceOwner {
                mixer,
                desc,
                events,
                lost: lost_tx,
            };
            owner.run(commands_rx, ready_tx);
        })
        .map_err(|e| PetalMixError::AudioDevice(format!("Failed to spawn device thread: {}", e)))?;

    let ready = ready_rx.recv().unwrap_or_else(|_| {
        Err(PetalMixError::AudioDevice(
            "Device thread exited before opening".into(),
        ))
    });
    match ready {
        Ok(spec) => Ok(DeviceHandle {
            commands: commands_tx,
            thread: Some(thread),
            spec,
        }),
        Err(e) => {
            let _ = thread.join();
            Err(e)
        }
    }
}

fn stream_config(spec: AudioSpec, block_size: Option<u32>) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: spec.channels,
        sample_rate: cpal::SampleRate(spec.sample_rate),
        buffer_size: block_size.map_or(cpal::BufferSize::Default, cpal::BufferSize::Fixed),
    }
}

struct DeviceOwner {
    mixer: Weak<MixerShared>,
    desc: MixerDesc,
    events: Sender<MixerEvent>,
    lost: Sender<DeviceCommand>,
}

impl DeviceOwner {
    fn run(self, commands: Receiver<DeviceCommand>, ready: Sender<Result<AudioSpec>>) {
        let (mut stream, mut spec) = match self.open_stream() {
            Ok((stream, spec)) => (Some(stream), spec),
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(spec));
        let mut paused = false;

        for command in commands.iter() {
            match command {
                DeviceCommand::Pause => {
                    paused = true;
                    if let Some(stream) = &stream {
                        if let Err(e) = stream.pause() {
                            self.report(format!("Failed to pause stream: {}", e));
                        }
                    }
                }
                DeviceCommand::Resume => {
                    paused = false;
                    if let Some(stream) = &stream {
                        if let Err(e) = stream.play() {
                            self.report(format!("Failed to resume stream: {}", e));
                        }
                    }
                }
                DeviceCommand::Lost(reason) => {
                    log::warn!("Output device lost ({}), reopening default device", reason);
                    stream = None;
                    match self.reopen(spec, paused) {
                        Ok((reopened, new_spec)) => {
                            stream = Some(reopened);
                            spec = new_spec;
                        }
                        Err(e) => self.report(format!("Failed to reopen device: {}", e)),
                    }
                }
                DeviceCommand::Close => break,
            }
        }
        drop(stream);
        log::debug!("Device thread exiting");
    }

    fn report(&self, error: String) {
        log::error!("{}", error);
        let _ = self.events.try_send(MixerEvent::DeviceError { error });
    }

    fn reopen(&self, old: AudioSpec, paused: bool) -> Result<(cpal::Stream, AudioSpec)> {
        let (stream, spec) = self.open_stream()?;
        if spec != old {
            if let Some(shared) = self.mixer.upgrade() {
                Mixer::from_shared(shared).apply_spec(spec)?;
            }
        }
        if paused {
            stream
                .pause()
                .map_err(|e| PetalMixError::AudioDevice(format!("Failed to pause stream: {}", e)))?;
        }
        Ok((stream, spec))
    }

    /// Builds and starts a stream on the default device, first with the
    /// requested format and then with the device's own if that fails.
    fn open_stream(&self) -> Result<(cpal::Stream, AudioSpec)> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or_else(|| {
            PetalMixError::AudioDevice("No default output device available".into())
        })?;
        let default_config = device.default_output_config().map_err(|e| {
            PetalMixError::AudioDevice(format!("Failed to get default config: {}", e))
        })?;
        log::info!(
            "Output device: {}",
            device.name().unwrap_or_else(|_| "<unknown>".into())
        );

        let requested = self.desc.spec();
        let (stream, spec) = match self.build(&device, default_config.sample_format(), requested) {
            Ok(stream) => (stream, requested),
            Err(e) => {
                let fallback = AudioSpec::new(
                    default_config.sample_rate().0,
                    default_config.channels(),
                );
                if fallback == requested {
                    return Err(e);
                }
                log::warn!("{}; falling back to device format {}", e, fallback);
                (
                    self.build(&device, default_config.sample_format(), fallback)?,
                    fallback,
                )
            }
        };

        stream
            .play()
            .map_err(|e| PetalMixError::AudioDevice(format!("Failed to start stream: {}", e)))?;
        Ok((stream, spec))
    }

    fn build(
        &self,
        device: &cpal::Device,
        format: cpal::SampleFormat,
        spec: AudioSpec,
    ) -> Result<cpal::Stream> {
        let config = stream_config(spec, self.desc.block_size);
        match format {
            cpal::SampleFormat::F32 => self.create_stream::<f32>(device, &config),
            cpal::SampleFormat::I16 => self.create_stream::<i16>(device, &config),
            cpal::SampleFormat::U16 => self.create_stream::<u16>(device, &config),
            other => Err(PetalMixError::AudioFormat(format!(
                "Unsupported sample format {:?}",
                other
            ))),
        }
    }

    fn create_stream<T>(
        &self,
        device: &cpal::Device,
        config: &cpal::StreamConfig,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let mixer = self.mixer.clone();
        let events = self.events.clone();
        let lost = self.lost.clone();
        let mut mix = Vec::<f32>::new();

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    if mix.len() < data.len() {
                        mix.resize(data.len(), 0.0);
                    }
                    let mix = &mut mix[..data.len()];
                    match mixer.upgrade() {
                        Some(shared) => shared.render(mix),
                        None => mix.fill(0.0),
                    }
                    for (sample, value) in data.iter_mut().zip(mix.iter()) {
                        *sample = T::from_sample(*value);
                    }
                },
                move |err| {
                    log::error!("Audio stream error: {}", err);
                    let _ = events.try_send(MixerEvent::DeviceError {
                        error: err.to_string(),
                    });
                    if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                        let _ = lost.send(DeviceCommand::Lost(err.to_string()));
                    }
                },
                None,
            )
            .map_err(|e| PetalMixError::AudioDevice(format!("Failed to build stream: {}", e)))
    }
}
