//! Microphone capture via cpal.
//!
//! ```text
//! cpal input callback ──push_slice──► SPSC ring ──pop_slice──► capture worker
//!   (downmix to mono, gated)                                    │ RateConverter → 16 kHz
//!                                                               │ FrameAssembler → 4096
//!                                                               │ VolumeTap::publish
//!                                                               ▼
//!                                                    FrameSender (call loop)
//! ```
//!
//! The callback is allocation-free after its first invocation and only writes
//! while the transmit gate is open, so nothing is buffered between device open
//! and the remote session confirming it is ready.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
};
use tracing::{debug, info, warn};
#[cfg(feature = "audio-cpal")]
use tracing::error;

use crate::{
    audio::{resample::RateConverter, CaptureConfig, FrameSender, MicrophoneStream},
    buffering::{create_audio_ring, frame::FrameAssembler, AudioConsumer, AudioProducer, Consumer},
    error::{Result, VoxlinkError},
    monitor::VolumeTap,
};
#[cfg(feature = "audio-cpal")]
use crate::buffering::Producer;

/// Samples drained from the ring per worker iteration.
const DRAIN_CHUNK: usize = 960;

/// Worker sleep when the ring is empty (avoids busy-wait burning a core).
const SLEEP_EMPTY_MS: u64 = 5;

/// Handle to an open cpal input stream.
///
/// **Not `Send`**: `cpal::Stream` is bound to its creation thread on Windows/macOS.
/// Create and drop this type on the same OS thread.
pub struct AudioCapture {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Callback writes only while this is `true`.
    gate: Arc<AtomicBool>,
    /// Actual capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
}

impl AudioCapture {
    /// Open an input device by preferred name, otherwise fall back to the
    /// default input device and then the first available device.
    ///
    /// # Errors
    /// - `VoxlinkError::MicrophonePermission` when the device refuses to open.
    /// - `VoxlinkError::NoDefaultInputDevice` when there is no microphone at all.
    /// - `VoxlinkError::AudioStream` for any other stream failure.
    #[cfg(feature = "audio-cpal")]
    pub fn open_with_preference(
        producer: AudioProducer,
        gate: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let mut selected_device = None;

        if let Some(preferred_name) = preferred_device_name {
            match host.input_devices() {
                Ok(mut devices) => {
                    selected_device = devices.find(|device| {
                        device
                            .name()
                            .map(|name| name == preferred_name)
                            .unwrap_or(false)
                    });

                    if selected_device.is_none() {
                        warn!(
                            "preferred input device '{}' not found, falling back",
                            preferred_name
                        );
                    }
                }
                Err(e) => {
                    warn!("failed to list input devices while resolving preference: {e}");
                }
            }
        }

        let device = if let Some(device) = selected_device {
            device
        } else if let Some(default) = host.default_input_device() {
            default
        } else {
            let mut devices = host
                .input_devices()
                .map_err(|e| VoxlinkError::AudioDevice(e.to_string()))?;
            let fallback = devices.next().ok_or(VoxlinkError::NoDefaultInputDevice)?;
            warn!("no default input device, falling back to first available input");
            fallback
        };

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device.default_input_config().map_err(|e| match e {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                VoxlinkError::MicrophonePermission(e.to_string())
            }
            other => VoxlinkError::AudioDevice(other.to_string()),
        })?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();

        info!(sample_rate, channels, "input config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let g = Arc::clone(&gate);
        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_mono_input::<f32>(&device, &config, producer, g, |s| s),
            SampleFormat::I16 => {
                build_mono_input::<i16>(&device, &config, producer, g, |s| s as f32 / 32768.0)
            }
            SampleFormat::U16 => build_mono_input::<u16>(&device, &config, producer, g, |s| {
                (s as f32 - 32768.0) / 32768.0
            }),
            SampleFormat::U8 => build_mono_input::<u8>(&device, &config, producer, g, |s| {
                (s as f32 - 128.0) / 128.0
            }),
            fmt => {
                return Err(VoxlinkError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                VoxlinkError::MicrophonePermission(e.to_string())
            }
            other => VoxlinkError::AudioStream(other.to_string()),
        })?;

        stream
            .play()
            .map_err(|e| VoxlinkError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            gate,
            sample_rate,
        })
    }
}

impl AudioCapture {
    /// Close the gate: the callback no-ops from its next invocation on.
    pub fn stop(&self) {
        self.gate.store(false, Ordering::Release);
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open_with_preference(
        _producer: AudioProducer,
        _gate: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        Err(VoxlinkError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

/// Build an input stream of any sample type that downmixes to mono f32 and
/// pushes into the ring while `gate` is open.
#[cfg(feature = "audio-cpal")]
fn build_mono_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    gate: Arc<AtomicBool>,
    to_f32: fn(T) -> f32,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample + 'static,
{
    let ch = config.channels.max(1) as usize;
    let mut mix_buf: Vec<f32> = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _info: &cpal::InputCallbackInfo| {
            if !gate.load(Ordering::Relaxed) {
                return;
            }
            let frames = data.len() / ch;
            mix_buf.resize(frames, 0.0);
            for (f, slot) in mix_buf.iter_mut().enumerate() {
                let base = f * ch;
                let mut sum = 0f32;
                for c in 0..ch {
                    sum += to_f32(data[base + c]);
                }
                *slot = sum / ch as f32;
            }
            let written = producer.push_slice(&mix_buf);
            if written < mix_buf.len() {
                warn!("ring buffer full: dropped {} frames", mix_buf.len() - written);
            }
        },
        |err| error!("input stream error: {err}"),
        None,
    )
}

/// Send-able handle to a microphone running on its own worker thread.
pub struct CpalMicrophone {
    gate: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    tap: VolumeTap,
    worker: Option<JoinHandle<()>>,
}

impl CpalMicrophone {
    /// Open the microphone and block until the device confirms (or refuses).
    pub fn open(config: CaptureConfig, frames: FrameSender) -> Result<Self> {
        let gate = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));
        let tap = VolumeTap::default();

        // Sync oneshot: worker signals open success/failure back to us.
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        let worker = {
            let gate = Arc::clone(&gate);
            let alive = Arc::clone(&alive);
            let tap = tap.clone();
            thread::Builder::new()
                .name("voxlink-capture".into())
                .spawn(move || {
                    // Stream must be created and dropped on THIS thread.
                    let (producer, consumer) = create_audio_ring();
                    let capture = match AudioCapture::open_with_preference(
                        producer,
                        Arc::clone(&gate),
                        config.preferred_device.as_deref(),
                    ) {
                        Ok(c) => {
                            let _ = open_tx.send(Ok(c.sample_rate));
                            c
                        }
                        Err(e) => {
                            let _ = open_tx.send(Err(e));
                            return;
                        }
                    };

                    run_worker(CaptureWorker {
                        consumer,
                        gate,
                        alive,
                        frames,
                        tap,
                        device_rate: capture.sample_rate,
                        config,
                    });

                    capture.stop();
                    drop(capture);
                    debug!("capture worker exited, input device released");
                })?
        };

        match open_rx.recv() {
            Ok(Ok(rate)) => {
                info!(device_rate = rate, "microphone acquired");
                Ok(Self {
                    gate,
                    alive,
                    tap,
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
                    "capture worker died before opening the device"
                )))
            }
        }
    }
}

impl MicrophoneStream for CpalMicrophone {
    fn start_transmitting(&mut self) {
        if self.alive.load(Ordering::Acquire) {
            self.gate.store(true, Ordering::Release);
            info!("microphone transmitting");
        }
    }

    fn volume_tap(&self) -> Option<VolumeTap> {
        Some(self.tap.clone())
    }

    fn stop(&mut self) {
        self.gate.store(false, Ordering::Release);
        self.alive.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("capture worker panicked during shutdown");
            }
            self.tap.clear();
            info!("microphone released");
        }
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureWorker {
    consumer: AudioConsumer,
    gate: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    frames: FrameSender,
    tap: VolumeTap,
    device_rate: u32,
    config: CaptureConfig,
}

/// Drain the ring until `alive` drops, emitting fixed-size transport frames.
fn run_worker(mut w: CaptureWorker) {
    let mut converter = match RateConverter::new(w.device_rate, w.config.sample_rate, DRAIN_CHUNK)
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("failed to create capture resampler: {e}");
            return;
        }
    };
    let mut assembler = FrameAssembler::new(w.config.frame_len, w.config.sample_rate);
    let mut raw = vec![0f32; DRAIN_CHUNK];

    while w.alive.load(Ordering::Acquire) {
        let n = w.consumer.pop_slice(&mut raw);
        if n == 0 {
            thread::sleep(Duration::from_millis(SLEEP_EMPTY_MS));
            continue;
        }
        if !w.gate.load(Ordering::Acquire) {
            continue;
        }

        let resampled = converter.process(&raw[..n]);
        if resampled.is_empty() {
            continue;
        }

        let mut receiver_gone = false;
        assembler.push(&resampled, |frame| {
            w.tap.publish(&frame.samples);
            if w.frames.send(frame).is_err() {
                receiver_gone = true;
            }
        });
        if receiver_gone {
            debug!("frame receiver dropped, stopping capture worker");
            break;
        }
    }

    converter.reset();
    assembler.clear();
}
