//! Speaker playback via cpal.
//!
//! ```text
//! call loop ──MixerCommand──► output callback (Mixer::render) ──► device
//!     ▲                              │ frames_rendered = output clock
//!     └── EndedSender ◄── worker ◄───┘ MixerEvents (bounded, try_send)
//! ```
//!
//! The worker reports finished ids and drops the returned sample buffers, so
//! the callback itself never frees memory.
//!
//! The output clock is the number of frames the callback has rendered divided
//! by the device rate. Start times arrive in seconds and are converted to
//! absolute device frames, so scheduling stays sample-accurate even when the
//! device rate differs from the 24 kHz speech rate.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::{
    audio::{
        mixer::{MixerCommand, MixerEvent},
        resample::resample_buffer, EndedSender, PlaybackConfig,
        PlaybackOutput, SourceId,
    },
    buffering::frame::PlaybackBuffer,
    error::{Result, VoxlinkError},
};

/// Capacity of the callback → worker event channel.
const EVENT_CAPACITY: usize = 512;

/// Scratch samples reserved up front for the callback's mix buffer.
const SCRATCH_RESERVE: usize = 16_384;

/// How often the worker re-checks its shutdown flag while idle.
const WORKER_POLL_MS: u64 = 20;

/// Send-able handle to an output stream running on its own worker thread.
pub struct CpalOutput {
    commands: Sender<MixerCommand>,
    frames_rendered: Arc<AtomicU64>,
    device_rate: u32,
    alive: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the default output device and block until the stream is playing.
    pub fn open(config: PlaybackConfig, ended: EndedSender) -> Result<Self> {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<MixerCommand>();
        let frames_rendered = Arc::new(AtomicU64::new(0));
        let alive = Arc::new(AtomicBool::new(true));
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        let worker = {
            let frames_rendered = Arc::clone(&frames_rendered);
            let alive = Arc::clone(&alive);
            thread::Builder::new()
                .name("voxlink-playback".into())
                .spawn(move || {
                    let (event_tx, event_rx) = crossbeam_channel::bounded(EVENT_CAPACITY);
                    let stream = match open_stream(cmd_rx, event_tx, frames_rendered) {
                        Ok((stream, rate)) => {
                            let _ = open_tx.send(Ok(rate));
                            stream
                        }
                        Err(e) => {
                            let _ = open_tx.send(Err(e));
                            return;
                        }
                    };

                    forward_events(&event_rx, &ended, &alive);

                    drop(stream);
                    debug!("playback worker exited, output device released");
                })?
        };

        match open_rx.recv() {
            Ok(Ok(device_rate)) => {
                info!(
                    device_rate,
                    speech_rate = config.sample_rate,
                    "output device opened"
                );
                Ok(Self {
                    commands: cmd_tx,
                    frames_rendered,
                    device_rate,
                    alive,
                    worker: Some(worker),
                })
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(VoxlinkError::Other(anyhow::anyhow!(
                    "playback worker died before opening the device"
                )))
            }
        }
    }

    fn send(&self, command: MixerCommand) {
        if self.commands.send(command).is_err() {
            debug!("output callback gone, command discarded");
        }
    }
}

impl PlaybackOutput for CpalOutput {
    fn current_time(&self) -> f64 {
        self.frames_rendered.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    fn schedule(&mut self, id: SourceId, buffer: PlaybackBuffer, start_at: f64) -> Result<()> {
        if self.worker.is_none() {
            return Err(VoxlinkError::AudioStream("output is closed".into()));
        }
        let source_rate = buffer.sample_rate();
        let samples = resample_buffer(&buffer.into_mono(), source_rate, self.device_rate)?;
        let start_frame = (start_at.max(0.0) * self.device_rate as f64).round() as u64;
        self.send(MixerCommand::Schedule {
            id,
            samples,
            start_frame,
        });
        Ok(())
    }

    fn stop(&mut self, id: SourceId) {
        self.send(MixerCommand::Stop { id });
    }

    fn close(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.send(MixerCommand::StopAll);
        self.alive.store(false, Ordering::Release);
        if worker.join().is_err() {
            warn!("playback worker panicked during shutdown");
        }
        info!("output device released");
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Relay mixer events to the async side until shut down. Sample buffers are
/// dropped here, on the worker.
fn forward_events(events: &Receiver<MixerEvent>, ended: &EndedSender, alive: &AtomicBool) {
    while alive.load(Ordering::Acquire) {
        match events.recv_timeout(Duration::from_millis(WORKER_POLL_MS)) {
            Ok(event) => relay(event, ended),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    // Buffers retired by the final StopAll.
    for event in events.try_iter() {
        relay(event, ended);
    }
}

fn relay(event: MixerEvent, ended: &EndedSender) {
    if let MixerEvent::Rejected { id, .. } = &event {
        warn!(%id, "mixer full, speech chunk skipped");
    }
    if let Some(id) = event.finished_id() {
        // A closed receiver means the call loop is tearing down.
        let _ = ended.send(id);
    }
}

#[cfg(feature = "audio-cpal")]
fn open_stream(
    commands: Receiver<MixerCommand>,
    events: Sender<MixerEvent>,
    frames_rendered: Arc<AtomicU64>,
) -> Result<(cpal::Stream, u32)> {
    use cpal::{
        traits::{DeviceTrait, HostTrait, StreamTrait},
        SampleFormat, SampleRate, StreamConfig,
    };

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(VoxlinkError::NoDefaultOutputDevice)?;

    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening output device"
    );

    let supported = device
        .default_output_config()
        .map_err(|e| VoxlinkError::AudioDevice(e.to_string()))?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();

    info!(sample_rate, channels, "output config selected");

    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match supported.sample_format() {
        SampleFormat::F32 => {
            build_output::<f32>(&device, &config, commands, events, frames_rendered, |s| s)
        }
        SampleFormat::I16 => {
            build_output::<i16>(&device, &config, commands, events, frames_rendered, |s| {
                (s * 32767.0) as i16
            })
        }
        SampleFormat::U16 => {
            build_output::<u16>(&device, &config, commands, events, frames_rendered, |s| {
                ((s + 1.0) * 32767.5) as u16
            })
        }
        fmt => {
            return Err(VoxlinkError::AudioStream(format!(
                "unsupported output sample format: {fmt:?}"
            )))
        }
    }
    .map_err(|e| VoxlinkError::AudioStream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| VoxlinkError::AudioStream(e.to_string()))?;

    Ok((stream, sample_rate))
}

#[cfg(not(feature = "audio-cpal"))]
fn open_stream(
    _commands: Receiver<MixerCommand>,
    _events: Sender<MixerEvent>,
    _frames_rendered: Arc<AtomicU64>,
) -> Result<((), u32)> {
    Err(VoxlinkError::AudioStream(
        "compiled without audio-cpal feature".into(),
    ))
}

/// Build an output stream that renders the mixer into any sample type.
#[cfg(feature = "audio-cpal")]
fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    commands: Receiver<MixerCommand>,
    events: Sender<MixerEvent>,
    frames_rendered: Arc<AtomicU64>,
    from_f32: fn(f32) -> T,
) -> std::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + 'static,
{
    use cpal::traits::DeviceTrait;

    let channels = config.channels.max(1) as usize;
    let mut mixer = crate::audio::mixer::Mixer::new();
    let mut scratch: Vec<f32> = Vec::with_capacity(SCRATCH_RESERVE);

    device.build_output_stream(
        config,
        move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
            let mut retire = |event: MixerEvent| {
                if events.try_send(event).is_err() {
                    warn!("mixer event channel full, event dropped in callback");
                }
            };
            while let Ok(command) = commands.try_recv() {
                mixer.apply(command, &mut retire);
            }
            scratch.resize(data.len(), 0.0);
            mixer.render(&mut scratch, channels, &mut retire);
            for (slot, sample) in data.iter_mut().zip(scratch.iter()) {
                *slot = from_f32(*sample);
            }
            frames_rendered.store(mixer.position(), Ordering::Release);
        },
        |err| tracing::error!("output stream error: {err}"),
        None,
    )
}
