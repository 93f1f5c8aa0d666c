//! Everything one call owns, in one place.
//!
//! A `Session` is built fresh for each call and torn down exactly once.
//! The call loop uses [`Session::shutdown`], which joins the device worker
//! threads on the blocking pool. [`Session::cleanup`] is the synchronous
//! form; it is idempotent and also runs on drop, so any exit path (hang-up,
//! remote close, error, engine dropped mid-call) releases the microphone, the
//! output device, queued speech, the remote handle and the volume loop.

use std::sync::{atomic::AtomicU32, Arc};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    audio::{MicrophoneStream, PlaybackOutput, SourceId},
    buffering::frame::AudioFrame,
    codec::{encode_frame, EncodedAudioBlob},
    error::{Result, VoxlinkError},
    ipc::events::VolumeEvent,
    monitor::VolumeMonitor,
    playback::{PlaybackScheduler, ScheduledChunk},
    remote::{SendOutcome, SessionLink},
};

/// What one `cleanup` call actually released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub buffers_stopped: usize,
    pub output_closed: bool,
    pub microphone_stopped: bool,
    pub link_closed: bool,
    pub monitor_stopped: bool,
}

impl TeardownReport {
    pub fn released_anything(&self) -> bool {
        self.buffers_stopped > 0
            || self.output_closed
            || self.microphone_stopped
            || self.link_closed
            || self.monitor_stopped
    }
}

pub struct Session {
    link: SessionLink,
    microphone: Option<Box<dyn MicrophoneStream>>,
    output: Option<Box<dyn PlaybackOutput>>,
    scheduler: PlaybackScheduler,
    monitor: Option<VolumeMonitor>,
}

impl Session {
    pub fn new(scheduler: PlaybackScheduler) -> Self {
        Self {
            link: SessionLink::NotConnected,
            microphone: None,
            output: None,
            scheduler,
            monitor: None,
        }
    }

    pub fn attach_microphone(&mut self, microphone: Box<dyn MicrophoneStream>) {
        self.microphone = Some(microphone);
    }

    pub fn attach_output(&mut self, output: Box<dyn PlaybackOutput>) {
        self.output = Some(output);
    }

    pub fn attach_link(&mut self, link: SessionLink) {
        self.link = link;
    }

    /// Remote confirmed: bind the handle for sending.
    pub fn open_link(&mut self) -> bool {
        self.link.mark_open()
    }

    pub fn link_is_open(&self) -> bool {
        self.link.is_open()
    }

    pub fn start_transmitting(&mut self) {
        if let Some(mic) = self.microphone.as_mut() {
            mic.start_transmitting();
        }
    }

    /// Start the volume loop on the microphone's tap (or an idle loop).
    pub fn start_monitor(
        &mut self,
        divisor: f32,
        period: Duration,
        volume_tx: broadcast::Sender<VolumeEvent>,
        level: Arc<AtomicU32>,
    ) {
        if self.monitor.is_some() {
            return;
        }
        let tap = self.microphone.as_ref().and_then(|mic| mic.volume_tap());
        self.monitor = Some(VolumeMonitor::spawn(tap, divisor, period, volume_tx, level));
    }

    /// Encode and offer one captured frame. Frames are never queued: if the
    /// link is not open the frame is dropped.
    pub fn send_frame(&mut self, frame: &AudioFrame) -> SendOutcome {
        if !self.link.is_open() {
            return SendOutcome::Dropped;
        }
        self.link.send(encode_frame(frame))
    }

    /// Decode and schedule one inbound chunk.
    pub fn play(&mut self, blob: &EncodedAudioBlob) -> Result<ScheduledChunk> {
        let output = self
            .output
            .as_deref_mut()
            .ok_or_else(|| VoxlinkError::AudioStream("output device not open".into()))?;
        self.scheduler.enqueue(blob, output)
    }

    /// Barge-in. Returns the number of buffers stopped.
    pub fn interrupt(&mut self) -> usize {
        match self.output.as_deref_mut() {
            Some(output) => self.scheduler.interrupt(output),
            None => 0,
        }
    }

    pub fn on_ended(&mut self, id: SourceId) -> bool {
        self.scheduler.on_ended(id)
    }

    pub fn in_flight_len(&self) -> usize {
        self.scheduler.in_flight_len()
    }

    pub fn cursor(&self) -> f64 {
        self.scheduler.cursor()
    }

    /// Release everything this session holds. Safe to call any number of
    /// times and with nothing acquired. Blocks while device workers exit.
    pub fn cleanup(&mut self) -> TeardownReport {
        let buffers_stopped = self.interrupt();
        let devices = self.take_devices();
        let report = devices.report(buffers_stopped);
        devices.release();
        self.finish_teardown(report)
    }

    /// Async form of [`Session::cleanup`]: the devices are released on the
    /// blocking pool so the runtime worker never waits on an audio thread.
    pub async fn shutdown(&mut self) -> TeardownReport {
        let buffers_stopped = self.interrupt();
        let devices = self.take_devices();
        let report = devices.report(buffers_stopped);
        if let Err(e) = tokio::task::spawn_blocking(move || devices.release()).await {
            warn!("device release task failed: {e}");
        }
        self.finish_teardown(report)
    }

    fn take_devices(&mut self) -> HeldDevices {
        HeldDevices {
            output: self.output.take(),
            microphone: self.microphone.take(),
        }
    }

    /// Everything after the devices: remote handle, meter, scheduler.
    fn finish_teardown(&mut self, mut report: TeardownReport) -> TeardownReport {
        report.link_closed = self.link.close();
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
            report.monitor_stopped = true;
        }
        self.scheduler.reset();

        if report.released_anything() {
            info!(?report, "session torn down");
        } else {
            debug!("session cleanup: nothing to release");
        }
        report
    }
}

/// Device handles taken out of a session for release.
struct HeldDevices {
    output: Option<Box<dyn PlaybackOutput>>,
    microphone: Option<Box<dyn MicrophoneStream>>,
}

impl HeldDevices {
    fn report(&self, buffers_stopped: usize) -> TeardownReport {
        TeardownReport {
            buffers_stopped,
            output_closed: self.output.is_some(),
            microphone_stopped: self.microphone.is_some(),
            ..Default::default()
        }
    }

    /// Output first, then the microphone.
    fn release(self) {
        if let Some(mut output) = self.output {
            output.close();
        }
        if let Some(mut mic) = self.microphone {
            mic.stop();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffering::frame::PlaybackBuffer,
        codec::pcm16_bytes,
        monitor::VolumeTap,
        remote::AudioUplink,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default, Clone)]
    struct Counters {
        mic_stops: Arc<AtomicUsize>,
        release_threads: Arc<parking_lot::Mutex<Vec<thread::ThreadId>>>,
        output_closes: Arc<AtomicUsize>,
        source_stops: Arc<AtomicUsize>,
        uplink_closes: Arc<AtomicUsize>,
        sent: Arc<AtomicUsize>,
    }

    struct FakeMic(Counters);

    impl MicrophoneStream for FakeMic {
        fn start_transmitting(&mut self) {}

        fn volume_tap(&self) -> Option<VolumeTap> {
            None
        }

        fn stop(&mut self) {
            self.0.mic_stops.fetch_add(1, Ordering::SeqCst);
            self.0.release_threads.lock().push(thread::current().id());
        }
    }

    struct FakeOutput(Counters);

    impl PlaybackOutput for FakeOutput {
        fn current_time(&self) -> f64 {
            0.0
        }

        fn schedule(&mut self, _id: SourceId, _buffer: PlaybackBuffer, _start_at: f64) -> Result<()> {
            Ok(())
        }

        fn stop(&mut self, _id: SourceId) {
            self.0.source_stops.fetch_add(1, Ordering::SeqCst);
        }

        fn close(&mut self) {
            self.0.output_closes.fetch_add(1, Ordering::SeqCst);
            self.0.release_threads.lock().push(thread::current().id());
        }
    }

    struct FakeUplink(Counters);

    impl AudioUplink for FakeUplink {
        fn send_audio(&mut self, _blob: EncodedAudioBlob) -> Result<()> {
            self.0.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self) {
            self.0.uplink_closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn full_session(counters: &Counters) -> Session {
        let mut session = Session::new(PlaybackScheduler::new(24_000, 1));
        session.attach_microphone(Box::new(FakeMic(counters.clone())));
        session.attach_output(Box::new(FakeOutput(counters.clone())));
        session.attach_link(SessionLink::pending(Box::new(FakeUplink(counters.clone()))));
        session
    }

    fn speech(samples: usize) -> EncodedAudioBlob {
        EncodedAudioBlob::from_pcm16(&pcm16_bytes(&vec![0.1; samples]), 24_000)
    }

    #[test]
    fn cleanup_twice_releases_everything_exactly_once() {
        let counters = Counters::default();
        let mut session = full_session(&counters);
        session.open_link();
        session.play(&speech(2_400)).expect("first chunk");
        session.play(&speech(2_400)).expect("second chunk");

        let first = session.cleanup();
        let second = session.cleanup();

        assert_eq!(first.buffers_stopped, 2);
        assert!(first.output_closed && first.microphone_stopped && first.link_closed);
        assert_eq!(second, TeardownReport::default());

        assert_eq!(counters.mic_stops.load(Ordering::SeqCst), 1);
        assert_eq!(counters.output_closes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.uplink_closes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.source_stops.load(Ordering::SeqCst), 2);
        assert_eq!(session.in_flight_len(), 0);
        assert_eq!(session.cursor(), 0.0);
    }

    #[test]
    fn cleanup_with_nothing_acquired_is_safe() {
        let mut session = Session::new(PlaybackScheduler::new(24_000, 1));
        assert!(!session.cleanup().released_anything());
        assert!(!session.cleanup().released_anything());
    }

    #[test]
    fn drop_runs_cleanup() {
        let counters = Counters::default();
        drop(full_session(&counters));
        assert_eq!(counters.mic_stops.load(Ordering::SeqCst), 1);
        assert_eq!(counters.output_closes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.uplink_closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn frames_are_dropped_until_the_link_opens() {
        let counters = Counters::default();
        let mut session = full_session(&counters);
        let frame = AudioFrame::new(vec![0.0; 4_096], 16_000);

        assert!(matches!(session.send_frame(&frame), SendOutcome::Dropped));
        assert!(!session.link_is_open());
        assert!(session.open_link());
        assert!(session.link_is_open());
        assert!(matches!(session.send_frame(&frame), SendOutcome::Sent));
        session.cleanup();
        assert!(!session.link_is_open());
        assert!(matches!(session.send_frame(&frame), SendOutcome::Dropped));

        assert_eq!(counters.sent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn play_without_output_is_a_device_error() {
        let mut session = Session::new(PlaybackScheduler::new(24_000, 1));
        let err = session.play(&speech(240)).expect_err("no output attached");
        assert!(!err.is_chunk_local());
    }

    #[tokio::test]
    async fn shutdown_releases_devices_off_the_runtime_thread() {
        let counters = Counters::default();
        let mut session = full_session(&counters);
        session.open_link();
        session.play(&speech(2_400)).expect("chunk");

        let report = session.shutdown().await;
        assert_eq!(report.buffers_stopped, 1);
        assert!(report.output_closed && report.microphone_stopped && report.link_closed);

        let runtime_thread = thread::current().id();
        let threads = counters.release_threads.lock().clone();
        assert_eq!(threads.len(), 2);
        assert!(threads.iter().all(|id| *id != runtime_thread));

        assert_eq!(session.shutdown().await, TeardownReport::default());
        drop(session);
        assert_eq!(counters.mic_stops.load(Ordering::SeqCst), 1);
        assert_eq!(counters.output_closes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.uplink_closes.load(Ordering::SeqCst), 1);
    }
}
