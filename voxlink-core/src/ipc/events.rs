//! Event types broadcast by [`crate::CallEngine`].
//!
//! | Event | Source |
//! |-------|--------|
//! | `CallStatusEvent` | every accepted status transition |
//! | `VolumeEvent` | volume monitor, once per refresh tick |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Call status events
// ---------------------------------------------------------------------------

/// Emitted when the call status changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStatusEvent {
    pub status: CallStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Lifecycle of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// No call has been started yet.
    Idle,
    /// Devices acquired or being acquired; waiting for the remote to open.
    Connecting,
    /// Remote open, microphone transmitting, speech playing as it arrives.
    Active,
    /// Call finished (hang-up or remote close). A new call may be started.
    Ended,
    /// Call failed. A new call may be started.
    Error,
}

impl CallStatus {
    /// `ENDED` or `ERROR`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Error)
    }

    /// Whether `start_call` is accepted from this status.
    pub fn accepts_new_call(self) -> bool {
        matches!(self, Self::Idle | Self::Ended | Self::Error)
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Volume events
// ---------------------------------------------------------------------------

/// Emitted by the volume monitor while capture is running.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeEvent {
    /// Monotonically increasing per-monitor sequence number.
    pub seq: u64,
    /// Normalised capture level in [0.0, 1.0].
    pub level: f32,
}
