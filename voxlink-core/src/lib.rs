//! # voxlink-core
//!
//! Live duplex voice session engine SDK.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → capture worker (resample, 4096-sample frames) ──► codec::encode_frame
//!                   │ VolumeTap                                        │
//!                   ▼                                                  ▼
//!             VolumeMonitor                                   remote session (uplink)
//!                                                                      │
//! Speaker ◄── Mixer (output callback) ◄── PlaybackScheduler ◄── codec::decode_blob
//! ```
//!
//! One Tokio task per call serializes capture, network and output-clock
//! events. Device callbacks are allocation-free; all heap work happens on
//! worker threads or the call task.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod codec;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod monitor;
pub mod playback;
pub mod remote;

// Convenience re-exports for downstream crates
pub use audio::{AudioDevices, CpalDevices, MicrophoneStream, PlaybackOutput, SourceId};
pub use buffering::frame::{AudioFrame, PlaybackBuffer};
pub use codec::EncodedAudioBlob;
pub use engine::{CallConfig, CallEngine, DiagnosticsSnapshot};
pub use error::VoxlinkError;
pub use ipc::events::{CallStatus, CallStatusEvent, VolumeEvent};
pub use remote::{
    AudioUplink, EchoConnector, RemoteEvent, ServerMessage, SessionConfig, SessionConnector,
};
