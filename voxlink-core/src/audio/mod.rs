//! Device audio: microphone capture, speaker playback, and the seam that lets
//! the call engine run against real hardware or test doubles.
//!
//! # Design constraints
//!
//! cpal callbacks run on OS audio threads at elevated priority. They **must not**
//! block on a mutex or perform I/O. Capture therefore writes into an SPSC ring
//! buffer, and playback pulls commands from a lock-free channel and renders a
//! [`mixer::Mixer`]; all heap work (resampling, framing, decoding) happens on
//! worker threads or on the call loop.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Each stream is created *and* dropped on its own dedicated worker
//! thread; the handles returned to the engine only hold flags, channels and the
//! worker's `JoinHandle`, so they are `Send`.

pub mod capture;
pub mod mixer;
pub mod output;
pub mod resample;

use std::fmt;

use tokio::sync::mpsc;

use crate::{
    buffering::frame::{AudioFrame, PlaybackBuffer},
    error::Result,
    monitor::VolumeTap,
};

/// Identity of one scheduled playback buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src-{}", self.0)
    }
}

/// Capture worker → call loop.
pub type FrameSender = mpsc::UnboundedSender<AudioFrame>;

/// Output device → call loop: a scheduled buffer played to its end.
pub type EndedSender = mpsc::UnboundedSender<SourceId>;

/// How the microphone should be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Rate frames are delivered at (Hz), regardless of the device rate.
    pub sample_rate: u32,
    /// Samples per delivered frame.
    pub frame_len: usize,
    /// Input device name to prefer; falls back to the default device.
    pub preferred_device: Option<String>,
}

/// How decoded speech is laid out before it reaches the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

/// An acquired microphone.
///
/// The device is live as soon as it is returned, but frames are discarded
/// until [`MicrophoneStream::start_transmitting`] is called.
pub trait MicrophoneStream: Send {
    /// Begin forwarding frames to the [`FrameSender`] given at open time.
    fn start_transmitting(&mut self);

    /// Read-only tap on the captured signal for the volume meter, if the
    /// backend provides one.
    fn volume_tap(&self) -> Option<VolumeTap>;

    /// Stop capture and release the device. Irreversible and idempotent.
    fn stop(&mut self);
}

/// An output device that plays buffers at explicit times on its own clock.
pub trait PlaybackOutput: Send {
    /// Output clock in seconds. Monotonic, starts near zero when opened.
    fn current_time(&self) -> f64;

    /// Play `buffer` starting at `start_at` seconds on the output clock.
    /// When it finishes, `id` is reported through the [`EndedSender`].
    fn schedule(&mut self, id: SourceId, buffer: PlaybackBuffer, start_at: f64) -> Result<()>;

    /// Silence one buffer immediately. Finished or unknown ids are a no-op.
    fn stop(&mut self, id: SourceId);

    /// Stop everything and release the device. Idempotent.
    fn close(&mut self);
}

/// Factory for the two device handles a call needs.
///
/// Both methods may block while the OS opens the device; the engine calls
/// them from `spawn_blocking`.
pub trait AudioDevices: Send + Sync + 'static {
    /// # Errors
    /// `VoxlinkError::MicrophonePermission` when the OS or user refuses access.
    fn open_microphone(
        &self,
        config: &CaptureConfig,
        frames: FrameSender,
    ) -> Result<Box<dyn MicrophoneStream>>;

    fn open_output(
        &self,
        config: &PlaybackConfig,
        ended: EndedSender,
    ) -> Result<Box<dyn PlaybackOutput>>;
}

/// Real hardware through cpal's default host.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalDevices;

impl CpalDevices {
    pub fn new() -> Self {
        Self
    }
}

impl AudioDevices for CpalDevices {
    fn open_microphone(
        &self,
        config: &CaptureConfig,
        frames: FrameSender,
    ) -> Result<Box<dyn MicrophoneStream>> {
        let mic = capture::CpalMicrophone::open(config.clone(), frames)?;
        Ok(Box::new(mic))
    }

    fn open_output(
        &self,
        config: &PlaybackConfig,
        ended: EndedSender,
    ) -> Result<Box<dyn PlaybackOutput>> {
        let output = output::CpalOutput::open(*config, ended)?;
        Ok(Box::new(output))
    }
}
