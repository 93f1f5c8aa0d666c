//! The per-call event loop.
//!
//! ## Flow
//!
//! ```text
//! acquire microphone ─► acquire output ─► connect ─┐
//!   (spawn_blocking)      (spawn_blocking)         │
//!                                                  ▼
//!        ┌──────────── select! (biased) ───────────────────┐
//!        │ commands   : hang-up / engine dropped           │
//!        │ remote     : Open / Message / Close / Error     │
//!        │ ended ids  : playback buffer finished           │
//!        │ frames     : captured audio → encode → uplink   │
//!        └─────────────────────────────────────────────────┘
//!                                                  │
//!                       Session::shutdown ◄────────┘  then the terminal status
//! ```
//!
//! All three timelines (capture, network, output device) are serialized onto
//! this one task, so the scheduler's cursor and in-flight set have a single
//! writer.

use std::sync::{
    atomic::{AtomicU32, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    audio::{AudioDevices, EndedSender, FrameSender, SourceId},
    buffering::frame::AudioFrame,
    engine::{
        session::Session,
        state::{CallEvent, StatusMachine},
        CallConfig,
    },
    error::{Result, VoxlinkError},
    ipc::events::{CallStatus, VolumeEvent},
    playback::PlaybackScheduler,
    remote::{
        RemoteEvent, RemoteEventReceiver, SendOutcome, ServerMessage, SessionConnector,
        SessionLink,
    },
};

/// Control messages from the engine handle to the call loop.
#[derive(Debug)]
pub enum CallCommand {
    /// Tear down and report `ENDED`; `ack` fires once teardown is done.
    Hangup { ack: oneshot::Sender<()> },
}

/// Live counters for one call. Reset when a new call starts.
#[derive(Debug, Default)]
pub struct SessionDiagnostics {
    pub frames_captured: AtomicUsize,
    pub frames_sent: AtomicUsize,
    pub frames_dropped: AtomicUsize,
    pub chunks_received: AtomicUsize,
    pub chunks_scheduled: AtomicUsize,
    pub chunks_malformed: AtomicUsize,
    pub interruptions: AtomicUsize,
    pub buffers_stopped: AtomicUsize,
    pub buffers_completed: AtomicUsize,
}

impl SessionDiagnostics {
    pub fn reset(&self) {
        self.frames_captured.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.chunks_received.store(0, Ordering::Relaxed);
        self.chunks_scheduled.store(0, Ordering::Relaxed);
        self.chunks_malformed.store(0, Ordering::Relaxed);
        self.interruptions.store(0, Ordering::Relaxed);
        self.buffers_stopped.store(0, Ordering::Relaxed);
        self.buffers_completed.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_scheduled: self.chunks_scheduled.load(Ordering::Relaxed),
            chunks_malformed: self.chunks_malformed.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            buffers_stopped: self.buffers_stopped.load(Ordering::Relaxed),
            buffers_completed: self.buffers_completed.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicUsize, by: usize) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_captured: usize,
    pub frames_sent: usize,
    pub frames_dropped: usize,
    pub chunks_received: usize,
    pub chunks_scheduled: usize,
    pub chunks_malformed: usize,
    pub interruptions: usize,
    pub buffers_stopped: usize,
    pub buffers_completed: usize,
}

/// All context the call loop needs, passed as one struct so the spawn stays tidy.
pub struct CallContext {
    pub call_id: u64,
    pub config: CallConfig,
    pub devices: Arc<dyn AudioDevices>,
    pub connector: Arc<dyn SessionConnector>,
    pub machine: StatusMachine,
    pub commands: mpsc::UnboundedReceiver<CallCommand>,
    pub volume_tx: broadcast::Sender<VolumeEvent>,
    pub volume_level: Arc<AtomicU32>,
    pub diagnostics: Arc<SessionDiagnostics>,
}

/// How the loop ended.
enum Exit {
    /// User hang-up (`Some(ack)`), or the engine handle went away or the
    /// call was superseded (`None`).
    Hangup(Option<oneshot::Sender<()>>),
    RemoteClosed(Option<String>),
    Failed(VoxlinkError),
}

/// Run one call from `CONNECTING` to a terminal status.
pub async fn run(ctx: CallContext) {
    let span = info_span!("call", call_id = ctx.call_id);
    drive(ctx).instrument(span).await
}

async fn drive(mut ctx: CallContext) {
    info!(model = %ctx.config.model, "call starting");

    let mut session = Session::new(PlaybackScheduler::new(
        ctx.config.output_sample_rate,
        ctx.config.output_channels,
    ));
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let exit = match acquire(&mut ctx, &mut session, frame_tx, ended_tx).await {
        Err(exit) => exit,
        Ok(()) => match ctx.connector.connect(&ctx.config.session_config(), event_tx) {
            Err(e) => Exit::Failed(e),
            Ok(uplink) => {
                session.attach_link(SessionLink::pending(uplink));
                debug!("remote session pending");
                run_loop(&mut ctx, &mut session, &mut frame_rx, &mut ended_rx, &mut event_rx)
                    .await
            }
        },
    };

    finish(&ctx, &mut session, exit).await;
}

/// Open the microphone, then the output device. Each open may block on the
/// OS, so it runs on the blocking pool while hang-up stays responsive.
async fn acquire(
    ctx: &mut CallContext,
    session: &mut Session,
    frames: FrameSender,
    ended: EndedSender,
) -> std::result::Result<(), Exit> {
    let mut hangup = None;

    let devices = Arc::clone(&ctx.devices);
    let capture = ctx.config.capture_config();
    let mic = blocking_step(&mut ctx.commands, &mut hangup, move || {
        devices.open_microphone(&capture, frames)
    })
    .await;
    match mic {
        Ok(mic) => session.attach_microphone(mic),
        Err(e) => return Err(hangup.map(Exit::Hangup).unwrap_or(Exit::Failed(e))),
    }
    if let Some(ack) = hangup.take() {
        return Err(Exit::Hangup(ack));
    }

    let devices = Arc::clone(&ctx.devices);
    let playback = ctx.config.playback_config();
    let output = blocking_step(&mut ctx.commands, &mut hangup, move || {
        devices.open_output(&playback, ended)
    })
    .await;
    match output {
        Ok(output) => session.attach_output(output),
        Err(e) => return Err(hangup.map(Exit::Hangup).unwrap_or(Exit::Failed(e))),
    }
    if let Some(ack) = hangup.take() {
        return Err(Exit::Hangup(ack));
    }

    info!("audio devices acquired");
    Ok(())
}

/// Await a blocking open while recording (not acting on) a hang-up request.
/// The open always runs to completion so whatever it acquired gets released.
async fn blocking_step<T, F>(
    commands: &mut mpsc::UnboundedReceiver<CallCommand>,
    hangup: &mut Option<Option<oneshot::Sender<()>>>,
    open: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let mut task = tokio::task::spawn_blocking(open);
    loop {
        tokio::select! {
            joined = &mut task => {
                return joined.map_err(|e| {
                    VoxlinkError::Other(anyhow::anyhow!("device open task failed: {e}"))
                })?;
            }
            command = commands.recv(), if hangup.is_none() => {
                debug!("hang-up requested while opening a device");
                *hangup = Some(command.map(|CallCommand::Hangup { ack }| ack));
            }
        }
    }
}

async fn run_loop(
    ctx: &mut CallContext,
    session: &mut Session,
    frames: &mut mpsc::UnboundedReceiver<AudioFrame>,
    ended: &mut mpsc::UnboundedReceiver<SourceId>,
    events: &mut RemoteEventReceiver,
) -> Exit {
    let diag = Arc::clone(&ctx.diagnostics);

    loop {
        tokio::select! {
            biased;

            command = ctx.commands.recv() => {
                return Exit::Hangup(command.map(|CallCommand::Hangup { ack }| ack));
            }

            event = events.recv() => match event {
                None => {
                    return Exit::Failed(VoxlinkError::Connection(
                        "remote session ended without a close".into(),
                    ));
                }
                Some(RemoteEvent::Open) => {
                    if !session.open_link() {
                        warn!("duplicate open from remote ignored");
                        continue;
                    }
                    if ctx.machine.apply(ctx.call_id, CallEvent::RemoteOpened, None)
                        != Some(CallStatus::Active)
                    {
                        warn!("call no longer owns the status, tearing down");
                        return Exit::Hangup(None);
                    }
                    session.start_transmitting();
                    session.start_monitor(
                        ctx.config.volume_divisor,
                        Duration::from_millis(ctx.config.volume_refresh_ms),
                        ctx.volume_tx.clone(),
                        Arc::clone(&ctx.volume_level),
                    );
                    info!("remote session open, microphone transmitting");
                }
                Some(RemoteEvent::Message(message)) => {
                    if let Err(e) = handle_message(ctx, session, message) {
                        return Exit::Failed(e);
                    }
                }
                Some(RemoteEvent::Close { reason }) => return Exit::RemoteClosed(reason),
                Some(RemoteEvent::Error(message)) => {
                    return Exit::Failed(VoxlinkError::Connection(message));
                }
            },

            Some(id) = ended.recv() => {
                if session.on_ended(id) {
                    SessionDiagnostics::bump(&diag.buffers_completed, 1);
                    debug!(%id, in_flight = session.in_flight_len(), "buffer finished");
                }
            }

            Some(frame) = frames.recv() => {
                SessionDiagnostics::bump(&diag.frames_captured, 1);
                match session.send_frame(&frame) {
                    SendOutcome::Sent => SessionDiagnostics::bump(&diag.frames_sent, 1),
                    SendOutcome::Dropped => SessionDiagnostics::bump(&diag.frames_dropped, 1),
                    SendOutcome::Failed(e) => {
                        // Transport is going away; the close/error event ends the call.
                        debug!("outbound frame not sent: {e}");
                        SessionDiagnostics::bump(&diag.frames_dropped, 1);
                    }
                }
            }
        }
    }
}

/// Apply one server message: barge-in first, then any new speech.
fn handle_message(ctx: &CallContext, session: &mut Session, message: ServerMessage) -> Result<()> {
    let diag = &ctx.diagnostics;

    if ctx.machine.status_of(ctx.call_id) != Some(CallStatus::Active) {
        debug!("server message outside an active call dropped");
        return Ok(());
    }

    if message.interrupted {
        let stopped = session.interrupt();
        SessionDiagnostics::bump(&diag.interruptions, 1);
        SessionDiagnostics::bump(&diag.buffers_stopped, stopped);
        info!(stopped, "caller interrupted, queued speech flushed");
    }

    for blob in &message.audio {
        SessionDiagnostics::bump(&diag.chunks_received, 1);
        match session.play(blob) {
            Ok(chunk) => {
                SessionDiagnostics::bump(&diag.chunks_scheduled, 1);
                debug!(id = %chunk.id, start_at = chunk.start_at, "speech chunk queued");
            }
            Err(e) if e.is_chunk_local() => {
                SessionDiagnostics::bump(&diag.chunks_malformed, 1);
                warn!("dropping malformed speech chunk: {e}");
            }
            Err(e) => return Err(e),
        }
    }

    if message.turn_complete {
        debug!("agent turn complete");
    }
    Ok(())
}

/// Teardown always runs before the terminal status becomes observable.
async fn finish(ctx: &CallContext, session: &mut Session, exit: Exit) {
    session.shutdown().await;

    match exit {
        Exit::Hangup(ack) => {
            ctx.machine.apply(ctx.call_id, CallEvent::EndCall, None);
            match ack {
                Some(ack) => {
                    let _ = ack.send(());
                    info!("call ended by user");
                }
                None => info!("call handle released, call torn down"),
            }
        }
        Exit::RemoteClosed(reason) => {
            let detail = reason.unwrap_or_else(|| "remote closed the session".into());
            let status = ctx
                .machine
                .apply(ctx.call_id, CallEvent::RemoteClosed, Some(detail.clone()));
            match status {
                Some(CallStatus::Error) => warn!("remote closed before the session opened: {detail}"),
                _ => info!("call ended by remote: {detail}"),
            }
        }
        Exit::Failed(e) => {
            error!("call failed: {e}");
            ctx.machine.apply(ctx.call_id, CallEvent::Failure, Some(e.to_string()));
        }
    }
}
