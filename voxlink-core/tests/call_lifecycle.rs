use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use voxlink_core::audio::{CaptureConfig, EndedSender, FrameSender, PlaybackConfig};
use voxlink_core::codec::{decode_blob, pcm16_bytes};
use voxlink_core::error::{Result, VoxlinkError};
use voxlink_core::monitor::VolumeTap;
use voxlink_core::remote::RemoteEventSender;
use voxlink_core::{
    AudioDevices, AudioFrame, AudioUplink, CallConfig, CallEngine, CallStatus, CallStatusEvent,
    EncodedAudioBlob, MicrophoneStream, PlaybackBuffer, PlaybackOutput, RemoteEvent,
    ServerMessage, SessionConfig, SessionConnector, SourceId,
};

const WAIT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Fake devices
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DeviceLog {
    deny_microphone: bool,
    mic_opens: AtomicUsize,
    mic_stops: AtomicUsize,
    output_opens: AtomicUsize,
    output_closes: AtomicUsize,
    transmitting: AtomicBool,
    frames: Mutex<Option<FrameSender>>,
    ended: Mutex<Option<EndedSender>>,
    now: Mutex<f64>,
    scheduled: Mutex<Vec<(SourceId, f64, f64)>>,
    stopped: Mutex<Vec<SourceId>>,
}

impl DeviceLog {
    fn push_frame(&self, first_sample: f32) {
        let mut samples = vec![0.0; 4_096];
        samples[0] = first_sample;
        let frames = self.frames.lock();
        frames
            .as_ref()
            .expect("microphone not opened")
            .send(AudioFrame::new(samples, 16_000))
            .expect("call loop gone");
    }

    fn finish(&self, id: SourceId) {
        self.ended
            .lock()
            .as_ref()
            .expect("output not opened")
            .send(id)
            .expect("call loop gone");
    }

    fn set_now(&self, t: f64) {
        *self.now.lock() = t;
    }
}

#[derive(Clone)]
struct FakeDevices(Arc<DeviceLog>);

impl AudioDevices for FakeDevices {
    fn open_microphone(
        &self,
        _config: &CaptureConfig,
        frames: FrameSender,
    ) -> Result<Box<dyn MicrophoneStream>> {
        if self.0.deny_microphone {
            return Err(VoxlinkError::MicrophonePermission(
                "denied by test".into(),
            ));
        }
        self.0.mic_opens.fetch_add(1, Ordering::SeqCst);
        *self.0.frames.lock() = Some(frames);
        Ok(Box::new(FakeMic {
            log: Arc::clone(&self.0),
            stopped: false,
        }))
    }

    fn open_output(
        &self,
        _config: &PlaybackConfig,
        ended: EndedSender,
    ) -> Result<Box<dyn PlaybackOutput>> {
        self.0.output_opens.fetch_add(1, Ordering::SeqCst);
        *self.0.ended.lock() = Some(ended);
        Ok(Box::new(FakeOutput {
            log: Arc::clone(&self.0),
            closed: false,
        }))
    }
}

struct FakeMic {
    log: Arc<DeviceLog>,
    stopped: bool,
}

impl MicrophoneStream for FakeMic {
    fn start_transmitting(&mut self) {
        self.log.transmitting.store(true, Ordering::SeqCst);
    }

    fn volume_tap(&self) -> Option<VolumeTap> {
        None
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.log.transmitting.store(false, Ordering::SeqCst);
            self.log.mic_stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct FakeOutput {
    log: Arc<DeviceLog>,
    closed: bool,
}

impl PlaybackOutput for FakeOutput {
    fn current_time(&self) -> f64 {
        *self.log.now.lock()
    }

    fn schedule(&mut self, id: SourceId, buffer: PlaybackBuffer, start_at: f64) -> Result<()> {
        self.log
            .scheduled
            .lock()
            .push((id, start_at, buffer.duration_secs()));
        Ok(())
    }

    fn stop(&mut self, id: SourceId) {
        self.log.stopped.lock().push(id);
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.output_closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ---------------------------------------------------------------------------
// Fake remote
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RemoteLog {
    connects: AtomicUsize,
    uplink_closes: AtomicUsize,
    events: Mutex<Option<RemoteEventSender>>,
    sent: Mutex<Vec<EncodedAudioBlob>>,
}

impl RemoteLog {
    fn emit(&self, event: RemoteEvent) {
        self.events
            .lock()
            .as_ref()
            .expect("session not connected")
            .send(event)
            .expect("call loop gone");
    }
}

#[derive(Clone)]
struct FakeConnector(Arc<RemoteLog>);

impl SessionConnector for FakeConnector {
    fn connect(
        &self,
        _config: &SessionConfig,
        events: RemoteEventSender,
    ) -> Result<Box<dyn AudioUplink>> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        *self.0.events.lock() = Some(events);
        Ok(Box::new(FakeUplink {
            log: Arc::clone(&self.0),
            closed: false,
        }))
    }
}

struct FakeUplink {
    log: Arc<RemoteLog>,
    closed: bool,
}

impl AudioUplink for FakeUplink {
    fn send_audio(&mut self, blob: EncodedAudioBlob) -> Result<()> {
        self.log.sent.lock().push(blob);
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.uplink_closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Rig {
    engine: CallEngine,
    devices: Arc<DeviceLog>,
    remote: Arc<RemoteLog>,
    status_rx: broadcast::Receiver<CallStatusEvent>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn rig_with(devices: DeviceLog) -> Rig {
    init_tracing();
    let devices = Arc::new(devices);
    let remote = Arc::new(RemoteLog::default());
    let engine = CallEngine::new(
        CallConfig::default(),
        FakeDevices(Arc::clone(&devices)),
        FakeConnector(Arc::clone(&remote)),
    );
    let status_rx = engine.subscribe_status();
    Rig {
        engine,
        devices,
        remote,
        status_rx,
    }
}

fn rig() -> Rig {
    rig_with(DeviceLog::default())
}

async fn recv_status_with_timeout(
    rx: &mut broadcast::Receiver<CallStatusEvent>,
) -> CallStatusEvent {
    loop {
        match tokio::time::timeout(WAIT, rx.recv()).await {
            Ok(Ok(event)) => return event,
            Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) => panic!("status channel closed unexpectedly"),
            Err(_) => panic!("timed out waiting for status event"),
        }
    }
}

async fn expect_status(rx: &mut broadcast::Receiver<CallStatusEvent>, status: CallStatus) -> CallStatusEvent {
    let event = recv_status_with_timeout(rx).await;
    assert_eq!(event.status, status, "unexpected transition: {event:?}");
    event
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() >= WAIT {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Start a call and drive it to `ACTIVE`.
async fn open_call(rig: &mut Rig) {
    rig.engine.start_call().expect("start call");
    expect_status(&mut rig.status_rx, CallStatus::Connecting).await;
    let remote = Arc::clone(&rig.remote);
    wait_until("remote connect", || remote.events.lock().is_some()).await;
    rig.remote.emit(RemoteEvent::Open);
    expect_status(&mut rig.status_rx, CallStatus::Active).await;
}

fn speech(secs: f64) -> EncodedAudioBlob {
    let samples = vec![0.2f32; (secs * 24_000.0).round() as usize];
    EncodedAudioBlob::from_pcm16(&pcm16_bytes(&samples), 24_000)
}

fn assert_released_once(rig: &Rig) {
    assert_eq!(rig.devices.mic_stops.load(Ordering::SeqCst), 1);
    assert_eq!(rig.devices.output_closes.load(Ordering::SeqCst), 1);
    assert_eq!(rig.remote.uplink_closes.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn microphone_denied_goes_connecting_then_error_without_frames() {
    let mut rig = rig_with(DeviceLog {
        deny_microphone: true,
        ..Default::default()
    });

    rig.engine.start_call().expect("start call");
    expect_status(&mut rig.status_rx, CallStatus::Connecting).await;
    let failed = expect_status(&mut rig.status_rx, CallStatus::Error).await;

    let detail = failed.detail.expect("error detail");
    assert!(detail.contains("denied"), "detail: {detail}");
    assert_eq!(rig.engine.status(), CallStatus::Error);
    assert_eq!(rig.engine.diagnostics_snapshot().frames_captured, 0);
    assert_eq!(rig.remote.connects.load(Ordering::SeqCst), 0);
    assert_eq!(rig.devices.output_opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn frames_before_open_are_dropped_and_later_frames_sent_in_order() {
    let mut rig = rig();
    rig.engine.start_call().expect("start call");
    expect_status(&mut rig.status_rx, CallStatus::Connecting).await;

    let remote = Arc::clone(&rig.remote);
    wait_until("remote connect", || remote.events.lock().is_some()).await;
    assert!(!rig.devices.transmitting.load(Ordering::SeqCst));

    rig.devices.push_frame(0.9);
    rig.devices.push_frame(0.9);
    wait_until("pre-open frames dropped", || {
        rig.engine.diagnostics_snapshot().frames_dropped == 2
    })
    .await;
    assert!(remote.sent.lock().is_empty());
    rig.remote.emit(RemoteEvent::Open);
    expect_status(&mut rig.status_rx, CallStatus::Active).await;
    assert!(rig.devices.transmitting.load(Ordering::SeqCst));

    for value in [0.1, 0.2, 0.3] {
        rig.devices.push_frame(value);
    }
    wait_until("three frames sent", || remote.sent.lock().len() == 3).await;

    let firsts: Vec<f32> = rig
        .remote
        .sent
        .lock()
        .iter()
        .map(|blob| {
            assert_eq!(blob.mime_type(), "audio/pcm;rate=16000");
            decode_blob(blob, 16_000, 1).expect("decode sent frame").channel(0)[0]
        })
        .collect();
    for (got, want) in firsts.iter().zip([0.1f32, 0.2, 0.3]) {
        assert!((got - want).abs() < 1e-3, "got {got}, want {want}");
    }

    let diag = rig.engine.diagnostics_snapshot();
    assert_eq!(diag.frames_captured, 5);
    assert_eq!(diag.frames_dropped, 2);
    assert_eq!(diag.frames_sent, 3);

    rig.engine.end_call().await;
}

#[tokio::test]
async fn start_call_is_rejected_while_connecting_or_active() {
    let mut rig = rig();
    rig.engine.start_call().expect("first start");
    expect_status(&mut rig.status_rx, CallStatus::Connecting).await;
    assert!(matches!(
        rig.engine.start_call(),
        Err(VoxlinkError::AlreadyInCall)
    ));

    let remote = Arc::clone(&rig.remote);
    wait_until("remote connect", || remote.events.lock().is_some()).await;
    rig.remote.emit(RemoteEvent::Open);
    expect_status(&mut rig.status_rx, CallStatus::Active).await;
    assert!(matches!(
        rig.engine.start_call(),
        Err(VoxlinkError::AlreadyInCall)
    ));

    rig.engine.end_call().await;
    assert_eq!(rig.remote.connects.load(Ordering::SeqCst), 1);
    assert_eq!(rig.devices.mic_opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn inbound_speech_is_gapless_and_interruption_flushes_it() {
    let mut rig = rig();
    open_call(&mut rig).await;

    let t0 = 1.0;
    rig.devices.set_now(t0);
    for secs in [0.5, 0.3, 0.2] {
        rig.remote
            .emit(RemoteEvent::Message(ServerMessage::audio(speech(secs))));
    }
    let devices = Arc::clone(&rig.devices);
    wait_until("three chunks scheduled", || devices.scheduled.lock().len() == 3).await;

    let scheduled = rig.devices.scheduled.lock().clone();
    let starts: Vec<f64> = scheduled.iter().map(|(_, start, _)| *start).collect();
    assert!((starts[0] - t0).abs() < 1e-9);
    assert!((starts[1] - (t0 + 0.5)).abs() < 1e-9);
    assert!((starts[2] - (t0 + 0.8)).abs() < 1e-9);

    // First chunk finishes; the other two are still queued when the caller barges in.
    rig.devices.finish(scheduled[0].0);
    wait_until("first buffer completed", || {
        rig.engine.diagnostics_snapshot().buffers_completed == 1
    })
    .await;

    rig.devices.set_now(1.6);
    rig.remote
        .emit(RemoteEvent::Message(ServerMessage::interrupted()));
    wait_until("queued speech stopped", || devices.stopped.lock().len() == 2).await;
    assert_eq!(
        *rig.devices.stopped.lock(),
        vec![scheduled[1].0, scheduled[2].0]
    );

    // New speech resumes from "now", not from the stale cursor at t0 + 1.0.
    rig.remote
        .emit(RemoteEvent::Message(ServerMessage::audio(speech(0.1))));
    wait_until("post-interrupt chunk", || devices.scheduled.lock().len() == 4).await;
    let resumed = rig.devices.scheduled.lock()[3].1;
    assert!((resumed - 1.6).abs() < 1e-9, "resumed at {resumed}");

    let diag = rig.engine.diagnostics_snapshot();
    assert_eq!(diag.interruptions, 1);
    assert_eq!(diag.buffers_stopped, 2);
    assert_eq!(diag.chunks_scheduled, 4);

    rig.engine.end_call().await;
}

#[tokio::test]
async fn malformed_chunk_is_dropped_and_the_call_continues() {
    let mut rig = rig();
    open_call(&mut rig).await;

    rig.remote.emit(RemoteEvent::Message(ServerMessage {
        audio: vec![
            EncodedAudioBlob::new("!!!", "audio/pcm;rate=24000"),
            EncodedAudioBlob::from_pcm16(&[1, 2, 3], 24_000),
            speech(0.1),
        ],
        ..Default::default()
    }));

    let devices = Arc::clone(&rig.devices);
    wait_until("good chunk scheduled", || devices.scheduled.lock().len() == 1).await;

    let diag = rig.engine.diagnostics_snapshot();
    assert_eq!(diag.chunks_received, 3);
    assert_eq!(diag.chunks_malformed, 2);
    assert_eq!(diag.chunks_scheduled, 1);
    assert_eq!(rig.engine.status(), CallStatus::Active);

    rig.engine.end_call().await;
}

#[tokio::test]
async fn remote_close_ends_the_call_and_releases_everything_once() {
    let mut rig = rig();
    open_call(&mut rig).await;
    rig.remote
        .emit(RemoteEvent::Message(ServerMessage::audio(speech(0.5))));
    let devices = Arc::clone(&rig.devices);
    wait_until("chunk scheduled", || devices.scheduled.lock().len() == 1).await;

    rig.remote.emit(RemoteEvent::Close { reason: None });
    expect_status(&mut rig.status_rx, CallStatus::Ended).await;
    assert_released_once(&rig);
    assert_eq!(rig.devices.stopped.lock().len(), 1);

    // Hanging up afterwards is accepted and releases nothing twice.
    rig.engine.end_call().await;
    assert_eq!(rig.engine.status(), CallStatus::Ended);
    assert_released_once(&rig);
}

#[tokio::test]
async fn hang_up_while_connecting_releases_devices_and_handle() {
    let mut rig = rig();
    rig.engine.start_call().expect("start call");
    expect_status(&mut rig.status_rx, CallStatus::Connecting).await;
    let remote = Arc::clone(&rig.remote);
    wait_until("remote connect", || remote.events.lock().is_some()).await;

    rig.engine.end_call().await;
    expect_status(&mut rig.status_rx, CallStatus::Ended).await;
    assert_released_once(&rig);
    assert!(!rig.devices.transmitting.load(Ordering::SeqCst));
}

#[tokio::test]
async fn close_before_open_is_reported_as_error() {
    let mut rig = rig();
    rig.engine.start_call().expect("start call");
    expect_status(&mut rig.status_rx, CallStatus::Connecting).await;
    let remote = Arc::clone(&rig.remote);
    wait_until("remote connect", || remote.events.lock().is_some()).await;

    rig.remote.emit(RemoteEvent::Close {
        reason: Some("quota exceeded".into()),
    });
    let failed = expect_status(&mut rig.status_rx, CallStatus::Error).await;
    assert_eq!(failed.detail.as_deref(), Some("quota exceeded"));
    assert_released_once(&rig);
}

#[tokio::test]
async fn remote_error_then_a_new_call_can_start() {
    let mut rig = rig();
    open_call(&mut rig).await;

    rig.remote.emit(RemoteEvent::Error("socket reset".into()));
    let failed = expect_status(&mut rig.status_rx, CallStatus::Error).await;
    assert!(failed
        .detail
        .expect("error detail")
        .contains("socket reset"));
    assert_released_once(&rig);

    *rig.remote.events.lock() = None;
    open_call(&mut rig).await;
    assert_eq!(rig.remote.connects.load(Ordering::SeqCst), 2);
    assert_eq!(rig.devices.mic_opens.load(Ordering::SeqCst), 2);

    rig.engine.end_call().await;
    expect_status(&mut rig.status_rx, CallStatus::Ended).await;
    assert_eq!(rig.devices.mic_stops.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn end_call_without_a_call_keeps_idle() {
    let rig = rig();
    rig.engine.end_call().await;
    assert_eq!(rig.engine.status(), CallStatus::Idle);
}

#[tokio::test]
async fn dropping_the_engine_tears_the_call_down() {
    let mut rig = rig();
    open_call(&mut rig).await;

    let devices = Arc::clone(&rig.devices);
    let remote = Arc::clone(&rig.remote);
    drop(rig.engine);

    wait_until("microphone released", || {
        devices.mic_stops.load(Ordering::SeqCst) == 1
    })
    .await;
    assert_eq!(devices.output_closes.load(Ordering::SeqCst), 1);
    assert_eq!(remote.uplink_closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn late_hang_up_does_not_touch_a_newer_call() {
    let mut rig = rig();
    open_call(&mut rig).await;

    // Run the hang-up until it waits on teardown, then leave it parked.
    let mut first_hang_up = Box::pin(rig.engine.end_call());
    tokio::select! {
        biased;
        _ = &mut first_hang_up => panic!("hang-up finished before teardown ran"),
        _ = std::future::ready(()) => {}
    }
    expect_status(&mut rig.status_rx, CallStatus::Ended).await;
    assert_eq!(rig.devices.mic_stops.load(Ordering::SeqCst), 1);

    *rig.remote.events.lock() = None;
    rig.engine.start_call().expect("second call");
    expect_status(&mut rig.status_rx, CallStatus::Connecting).await;
    let remote = Arc::clone(&rig.remote);
    wait_until("second connect", || remote.events.lock().is_some()).await;

    first_hang_up.await;
    assert_eq!(rig.engine.status(), CallStatus::Connecting);
    assert_eq!(rig.devices.mic_stops.load(Ordering::SeqCst), 1);
    assert!(rig.status_rx.try_recv().is_err());

    rig.remote.emit(RemoteEvent::Open);
    expect_status(&mut rig.status_rx, CallStatus::Active).await;
    assert!(rig.devices.transmitting.load(Ordering::SeqCst));
    assert!(matches!(
        rig.engine.start_call(),
        Err(VoxlinkError::AlreadyInCall)
    ));

    rig.engine.end_call().await;
    expect_status(&mut rig.status_rx, CallStatus::Ended).await;
    assert_eq!(rig.devices.mic_stops.load(Ordering::SeqCst), 2);
    assert_eq!(rig.remote.uplink_closes.load(Ordering::SeqCst), 2);
}
