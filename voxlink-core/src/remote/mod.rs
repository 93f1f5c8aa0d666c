//! Remote duplex session seam.
//!
//! The hosted conversational endpoint is a black box. The engine only sees:
//!
//! - a [`SessionConnector`] that starts opening a session and hands back an
//!   [`AudioUplink`] for outbound audio, and
//! - a stream of [`RemoteEvent`]s on a channel, in the order
//!   `Open`, then any number of `Message`s, then at most one `Close` or
//!   `Error`.
//!
//! Connectors must uphold that ordering; the call loop relies on it.

pub mod echo;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{codec::EncodedAudioBlob, error::Result};

pub use echo::EchoConnector;

/// What the remote session is opened with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub model: String,
    pub system_instruction: String,
    pub voice: String,
}

/// One inbound server message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    /// Speech chunks in playback order. Usually zero or one.
    #[serde(default)]
    pub audio: Vec<EncodedAudioBlob>,
    /// The caller talked over the agent: drop everything still queued.
    #[serde(default)]
    pub interrupted: bool,
    /// The agent finished its turn.
    #[serde(default)]
    pub turn_complete: bool,
}

impl ServerMessage {
    pub fn audio(blob: EncodedAudioBlob) -> Self {
        Self {
            audio: vec![blob],
            ..Default::default()
        }
    }

    pub fn interrupted() -> Self {
        Self {
            interrupted: true,
            ..Default::default()
        }
    }
}

/// Session lifecycle notifications, delivered in order.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Open,
    Message(ServerMessage),
    Close { reason: Option<String> },
    Error(String),
}

pub type RemoteEventSender = mpsc::UnboundedSender<RemoteEvent>;
pub type RemoteEventReceiver = mpsc::UnboundedReceiver<RemoteEvent>;

/// Outbound half of an opened (or opening) session.
pub trait AudioUplink: Send {
    /// Queue one blob for transmission without waiting on the network.
    ///
    /// # Errors
    /// `VoxlinkError::Connection` when the transport is already gone.
    fn send_audio(&mut self, blob: EncodedAudioBlob) -> Result<()>;

    /// Close the session. Idempotent.
    fn close(&mut self);
}

/// Starts remote sessions.
pub trait SessionConnector: Send + Sync + 'static {
    /// Begin opening a session. Returns as soon as the attempt is under way;
    /// `RemoteEvent::Open` (or `Error`) arrives later on `events`.
    ///
    /// # Errors
    /// `VoxlinkError::Connection` when the attempt cannot even be started.
    fn connect(
        &self,
        config: &SessionConfig,
        events: RemoteEventSender,
    ) -> Result<Box<dyn AudioUplink>>;
}

/// Outcome of offering one blob to the link.
#[derive(Debug)]
pub enum SendOutcome {
    Sent,
    /// Link not open; the blob was discarded.
    Dropped,
    /// Transport refused the blob.
    Failed(crate::error::VoxlinkError),
}

/// Typed state of the session handle.
#[derive(Default)]
pub enum SessionLink {
    #[default]
    NotConnected,
    Pending(Box<dyn AudioUplink>),
    Open(Box<dyn AudioUplink>),
    Closed,
}

impl SessionLink {
    pub fn pending(uplink: Box<dyn AudioUplink>) -> Self {
        Self::Pending(uplink)
    }

    /// `Pending` → `Open`. Returns `false` from any other state.
    pub fn mark_open(&mut self) -> bool {
        match std::mem::take(self) {
            Self::Pending(uplink) => {
                *self = Self::Open(uplink);
                true
            }
            other => {
                *self = other;
                false
            }
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::Pending(_) => "pending",
            Self::Open(_) => "open",
            Self::Closed => "closed",
        }
    }

    /// Send only while `Open`; otherwise drop the blob on the floor.
    pub fn send(&mut self, blob: EncodedAudioBlob) -> SendOutcome {
        match self {
            Self::Open(uplink) => match uplink.send_audio(blob) {
                Ok(()) => SendOutcome::Sent,
                Err(e) => SendOutcome::Failed(e),
            },
            _ => SendOutcome::Dropped,
        }
    }

    /// Close the uplink if one is held and move to `Closed`.
    ///
    /// Returns `true` when an uplink was actually released.
    pub fn close(&mut self) -> bool {
        match std::mem::replace(self, Self::Closed) {
            Self::Pending(mut uplink) | Self::Open(mut uplink) => {
                uplink.close();
                debug!("session handle released");
                true
            }
            Self::NotConnected | Self::Closed => false,
        }
    }
}

impl std::fmt::Debug for SessionLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionLink").field(&self.state_name()).finish()
    }
}
