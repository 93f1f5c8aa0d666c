//! `CallEngine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! CallEngine::new()
//!     └─► start_call()   → status = Connecting, call loop spawned
//!             │              remote opens → Active
//!             │              remote closes → Ended   | failure → Error
//!         └─► end_call()  → teardown, status = Ended
//! ```
//!
//! `start_call()` is rejected with `AlreadyInCall` while a call is connecting
//! or active; `end_call()` is always accepted and waits for teardown.
//!
//! ## Threading
//!
//! The engine is `Send + Sync`; wrap it in `Arc<CallEngine>` to share it with
//! UI or event-forwarding tasks. Each call runs as one Tokio task that owns a
//! fresh [`session::Session`]; the engine only keeps a command channel to it.

pub mod call;
pub mod session;
pub mod state;

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    audio::{AudioDevices, CaptureConfig, PlaybackConfig},
    error::{Result, VoxlinkError},
    ipc::events::{CallStatus, CallStatusEvent, VolumeEvent},
    remote::{SessionConfig, SessionConnector},
};

pub use call::{DiagnosticsSnapshot, SessionDiagnostics};
pub use state::{CallEvent, StatusMachine};

/// Broadcast channel capacity for status and volume events.
const BROADCAST_CAP: usize = 256;

/// Configuration for `CallEngine`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CallConfig {
    /// Rate of outbound frames (Hz). Default: 16000.
    pub input_sample_rate: u32,
    /// Rate of inbound speech (Hz). Default: 24000.
    pub output_sample_rate: u32,
    /// Channel count of inbound speech. Default: 1.
    pub output_channels: u16,
    /// Samples per outbound frame. Default: 4096.
    pub frame_len: usize,
    /// Remote model identifier.
    pub model: String,
    /// Persona text sent when the session opens.
    pub system_instruction: String,
    /// Output voice selection.
    pub voice: String,
    /// Volume meter refresh period. Default: 16 ms (one display frame).
    pub volume_refresh_ms: u64,
    /// Divides the average byte-scaled spectrum into `[0, 1]`.
    /// Tuned by ear against conversational speech. Default: 50.
    pub volume_divisor: f32,
    /// Input device name to prefer. `None` uses the system default.
    pub preferred_input_device: Option<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            output_channels: 1,
            frame_len: 4_096,
            model: "live-native-audio".into(),
            system_instruction: "You are a friendly voice assistant. Keep replies short and conversational."
                .into(),
            voice: "default".into(),
            volume_refresh_ms: 16,
            volume_divisor: 50.0,
            preferred_input_device: None,
        }
    }
}

impl CallConfig {
    /// Overlay `VOXLINK_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Overlay values from any key lookup (the environment in production).
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(model) = non_empty("VOXLINK_MODEL") {
            self.model = model;
        }
        if let Some(voice) = non_empty("VOXLINK_VOICE") {
            self.voice = voice;
        }
        if let Some(instruction) = non_empty("VOXLINK_SYSTEM_INSTRUCTION") {
            self.system_instruction = instruction;
        }
        if let Some(device) = non_empty("VOXLINK_INPUT_DEVICE") {
            self.preferred_input_device = Some(device);
        }
    }

    /// Clamp numeric fields into workable ranges and tidy strings.
    pub fn normalize(mut self) -> Self {
        let defaults = Self::default();

        self.input_sample_rate = self.input_sample_rate.clamp(8_000, 48_000);
        self.output_sample_rate = self.output_sample_rate.clamp(8_000, 48_000);
        self.output_channels = self.output_channels.clamp(1, 2);
        self.frame_len = self.frame_len.clamp(256, 16_384);
        self.volume_refresh_ms = self.volume_refresh_ms.clamp(1, 1_000);
        if !self.volume_divisor.is_finite() || self.volume_divisor < 1.0 {
            self.volume_divisor = defaults.volume_divisor;
        }

        self.model = self.model.trim().to_string();
        if self.model.is_empty() {
            self.model = defaults.model;
        }
        self.voice = self.voice.trim().to_string();
        if self.voice.is_empty() {
            self.voice = defaults.voice;
        }
        self.preferred_input_device = self
            .preferred_input_device
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        self
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.input_sample_rate,
            frame_len: self.frame_len,
            preferred_device: self.preferred_input_device.clone(),
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            sample_rate: self.output_sample_rate,
            channels: self.output_channels,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            model: self.model.clone(),
            system_instruction: self.system_instruction.clone(),
            voice: self.voice.clone(),
        }
    }
}

struct ActiveCall {
    call_id: u64,
    commands: mpsc::UnboundedSender<call::CallCommand>,
    handle: JoinHandle<()>,
}

/// The top-level engine handle.
///
/// `CallEngine` is `Send + Sync`: all fields use interior mutability.
pub struct CallEngine {
    config: CallConfig,
    devices: Arc<dyn AudioDevices>,
    connector: Arc<dyn SessionConnector>,
    machine: StatusMachine,
    volume_tx: broadcast::Sender<VolumeEvent>,
    /// Latest volume level, stored as `f32` bits.
    volume_level: Arc<AtomicU32>,
    diagnostics: Arc<SessionDiagnostics>,
    active: Mutex<Option<ActiveCall>>,
    call_seq: AtomicU64,
}

impl CallEngine {
    /// Create an engine. Nothing is opened until `start_call()`.
    pub fn new(
        config: CallConfig,
        devices: impl AudioDevices,
        connector: impl SessionConnector,
    ) -> Self {
        Self::with_shared(config, Arc::new(devices), Arc::new(connector))
    }

    /// Like `new`, for backends already behind an `Arc`.
    pub fn with_shared(
        config: CallConfig,
        devices: Arc<dyn AudioDevices>,
        connector: Arc<dyn SessionConnector>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (volume_tx, _) = broadcast::channel(BROADCAST_CAP);

        Self {
            config: config.normalize(),
            devices,
            connector,
            machine: StatusMachine::new(status_tx),
            volume_tx,
            volume_level: Arc::new(AtomicU32::new(0f32.to_bits())),
            diagnostics: Arc::new(SessionDiagnostics::default()),
            active: Mutex::new(None),
            call_seq: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Start a new call.
    ///
    /// Returns as soon as the call loop is spawned; progress is reported
    /// through [`CallEngine::subscribe_status`]. Must be called from within a
    /// Tokio runtime.
    ///
    /// # Errors
    /// - `VoxlinkError::AlreadyInCall` while a call is connecting or active.
    /// - `VoxlinkError::Other` outside a Tokio runtime.
    pub fn start_call(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            VoxlinkError::Other(anyhow::anyhow!("start_call needs a Tokio runtime: {e}"))
        })?;

        let mut active = self.active.lock();
        let call_id = self.call_seq.load(Ordering::Relaxed) + 1;
        if self.machine.begin(call_id).is_none() {
            return Err(VoxlinkError::AlreadyInCall);
        }
        self.call_seq.store(call_id, Ordering::Relaxed);

        self.diagnostics.reset();
        self.volume_level.store(0f32.to_bits(), Ordering::Relaxed);

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let handle = runtime.spawn(call::run(call::CallContext {
            call_id,
            config: self.config.clone(),
            devices: Arc::clone(&self.devices),
            connector: Arc::clone(&self.connector),
            machine: self.machine.clone(),
            commands: commands_rx,
            volume_tx: self.volume_tx.clone(),
            volume_level: Arc::clone(&self.volume_level),
            diagnostics: Arc::clone(&self.diagnostics),
        }));

        // Only the owning call moves the status, so a terminal status means
        // the previous loop is already past teardown.
        *active = Some(ActiveCall {
            call_id,
            commands,
            handle,
        });
        info!(call_id, "call started");
        Ok(())
    }

    /// Hang up. Always accepted; waits until every resource is released and
    /// leaves the call at `Ended` (a no-op when no call was started).
    ///
    /// Only the call in progress when `end_call` was invoked is affected: a
    /// call started while this one is still tearing down keeps its status.
    pub async fn end_call(&self) {
        let Some(call) = self.active.lock().take() else {
            debug!("end_call with no call in progress");
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if call
            .commands
            .send(call::CallCommand::Hangup { ack: ack_tx })
            .is_ok()
        {
            let _ = ack_rx.await;
        }
        if let Err(e) = call.handle.await {
            warn!(call_id = call.call_id, "call task did not finish cleanly: {e}");
        }

        // Covers a loop that had already stopped on its own (ERROR / ENDED).
        self.machine.apply(call.call_id, CallEvent::EndCall, None);
    }

    /// Current call status (snapshot).
    pub fn status(&self) -> CallStatus {
        self.machine.status()
    }

    /// Subscribe to status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<CallStatusEvent> {
        self.machine.subscribe()
    }

    /// Subscribe to volume meter events.
    pub fn subscribe_volume(&self) -> broadcast::Receiver<VolumeEvent> {
        self.volume_tx.subscribe()
    }

    /// Latest normalised capture level in `[0, 1]`.
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_level.load(Ordering::Relaxed))
    }

    /// Snapshot of the current call's counters.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }
}
