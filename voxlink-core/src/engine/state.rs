//! Call status transitions.
//!
//! ```text
//! IDLE ──start──► CONNECTING ──opened──► ACTIVE ──remote close──► ENDED
//!                     │                     │
//!                     └──── failure ────────┴──────────────────► ERROR
//!
//! ENDED / ERROR ──start──► CONNECTING
//! any non-idle  ──end_call──► ENDED
//! ```
//!
//! [`next_status`] is the whole table; [`StatusMachine`] applies it under a
//! lock and broadcasts every accepted transition.
//!
//! The machine remembers which call last started. Events tagged with any
//! other call id are ignored, so a finished call's loop or a late `end_call`
//! can never move a newer call's status.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::ipc::events::{CallStatus, CallStatusEvent};

/// Inputs that can move a call between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    /// User asked for a new call.
    StartCall,
    /// Remote session confirmed it is open.
    RemoteOpened,
    /// Remote session ended normally.
    RemoteClosed,
    /// Remote error, refused microphone, or a device that would not open.
    Failure,
    /// User hung up.
    EndCall,
}

/// The transition table. `None` means the event is rejected (or is a no-op)
/// in `current`.
pub fn next_status(current: CallStatus, event: CallEvent) -> Option<CallStatus> {
    use CallEvent as E;
    use CallStatus as S;

    match (current, event) {
        (S::Idle | S::Ended | S::Error, E::StartCall) => Some(S::Connecting),
        (S::Connecting, E::RemoteOpened) => Some(S::Active),
        (S::Connecting | S::Active, E::Failure) => Some(S::Error),
        (S::Active, E::RemoteClosed) => Some(S::Ended),
        // A session that closes before it ever opened never delivered a call.
        (S::Connecting, E::RemoteClosed) => Some(S::Error),
        (S::Connecting | S::Active | S::Error, E::EndCall) => Some(S::Ended),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
struct Owned {
    status: CallStatus,
    /// Call that started most recently; `0` before the first call.
    call_id: u64,
}

/// Shared, lock-protected call status with change notifications.
#[derive(Clone)]
pub struct StatusMachine {
    current: Arc<Mutex<Owned>>,
    status_tx: broadcast::Sender<CallStatusEvent>,
}

impl StatusMachine {
    pub fn new(status_tx: broadcast::Sender<CallStatusEvent>) -> Self {
        Self {
            current: Arc::new(Mutex::new(Owned {
                status: CallStatus::Idle,
                call_id: 0,
            })),
            status_tx,
        }
    }

    pub fn status(&self) -> CallStatus {
        self.current.lock().status
    }

    /// Status as seen by `call_id`: `None` once a newer call has started.
    pub fn status_of(&self, call_id: u64) -> Option<CallStatus> {
        let current = self.current.lock();
        (current.call_id == call_id).then_some(current.status)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Start `call_id`. On acceptance the machine belongs to that call.
    pub fn begin(&self, call_id: u64) -> Option<CallStatus> {
        let mut current = self.current.lock();
        let next = self.transition(&mut current, CallEvent::StartCall, None)?;
        current.call_id = call_id;
        Some(next)
    }

    /// Apply `event` on behalf of `call_id`. Events from a call that no
    /// longer owns the machine are dropped. On acceptance the new status is
    /// stored and broadcast before the lock is released, so observers see
    /// transitions in order.
    pub fn apply(
        &self,
        call_id: u64,
        event: CallEvent,
        detail: Option<String>,
    ) -> Option<CallStatus> {
        let mut current = self.current.lock();
        if current.call_id != call_id {
            debug!(call_id, owner = current.call_id, ?event, "event from a stale call ignored");
            return None;
        }
        self.transition(&mut current, event, detail)
    }

    fn transition(
        &self,
        current: &mut Owned,
        event: CallEvent,
        detail: Option<String>,
    ) -> Option<CallStatus> {
        let from = current.status;
        let Some(next) = next_status(from, event) else {
            debug!(%from, ?event, "status event ignored");
            return None;
        };

        info!(%from, to = %next, ?event, "call status changed");
        current.status = next;
        let _ = self.status_tx.send(CallStatusEvent {
            status: next,
            detail,
        });
        Some(next)
    }
}
