//! Capture-side volume meter.
//!
//! ## Algorithm
//!
//! 1. Take the most recent `FFT_SIZE` samples from the [`VolumeTap`].
//! 2. Apply a Blackman window and run a forward FFT.
//! 3. Convert each bin magnitude to dB and map `[MIN_DB, MAX_DB]` onto a
//!    byte scale `0..=255`.
//! 4. Average the bins, divide by the empirical divisor, clamp to `[0, 1]`.
//!
//! The monitor is purely observational: it reads a copy of the latest samples
//! and never touches the capture path's timing.

use std::f32::consts::PI;
use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use rustfft::{num_complex::Complex, FftPlanner};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::debug;

use crate::ipc::events::VolumeEvent;

/// Analysis window length (samples).
pub const FFT_SIZE: usize = 256;

/// Bin magnitudes at or below this map to byte 0.
const MIN_DB: f32 = -100.0;

/// Bin magnitudes at or above this map to byte 255.
const MAX_DB: f32 = -30.0;

/// Shared window of the most recent capture samples.
#[derive(Debug, Clone, Default)]
pub struct VolumeTap(Arc<Mutex<Vec<f32>>>);

impl VolumeTap {
    /// Keep the last `FFT_SIZE` samples of `samples`.
    pub fn publish(&self, samples: &[f32]) {
        let mut window = self.0.lock();
        let tail = &samples[samples.len().saturating_sub(FFT_SIZE)..];
        window.extend_from_slice(tail);
        let excess = window.len().saturating_sub(FFT_SIZE);
        if excess > 0 {
            window.drain(..excess);
        }
    }

    /// Copy of the current window, `None` before anything was published.
    pub fn snapshot(&self) -> Option<Vec<f32>> {
        let window = self.0.lock();
        if window.is_empty() {
            None
        } else {
            Some(window.clone())
        }
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Stateful spectrum analyser (keeps the FFT plan and scratch buffers).
pub struct LevelMeter {
    fft: Arc<dyn rustfft::Fft<f32>>,
    window: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    divisor: f32,
}

impl LevelMeter {
    pub fn new(divisor: f32) -> Self {
        let fft = FftPlanner::<f32>::new().plan_fft_forward(FFT_SIZE);
        let window = (0..FFT_SIZE)
            .map(|n| {
                let x = 2.0 * PI * n as f32 / FFT_SIZE as f32;
                0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
            })
            .collect();
        Self {
            fft,
            window,
            buffer: vec![Complex::new(0.0, 0.0); FFT_SIZE],
            divisor: divisor.max(f32::EPSILON),
        }
    }

    /// Average byte-scaled spectral energy of `samples`, in `0.0..=255.0`.
    ///
    /// Short input is zero-padded at the front; only the most recent
    /// `FFT_SIZE` samples are analysed.
    pub fn byte_energy(&mut self, samples: &[f32]) -> f32 {
        let tail = &samples[samples.len().saturating_sub(FFT_SIZE)..];
        let offset = FFT_SIZE - tail.len();

        for (idx, slot) in self.buffer.iter_mut().enumerate() {
            let sample = if idx < offset { 0.0 } else { tail[idx - offset] };
            *slot = Complex::new(sample * self.window[idx], 0.0);
        }
        self.fft.process(&mut self.buffer);

        let bins = FFT_SIZE / 2;
        let total: f32 = self.buffer[..bins]
            .iter()
            .map(|c| {
                let magnitude = c.norm() / FFT_SIZE as f32;
                let db = if magnitude > 0.0 {
                    20.0 * magnitude.log10()
                } else {
                    MIN_DB
                };
                (255.0 * (db - MIN_DB) / (MAX_DB - MIN_DB)).clamp(0.0, 255.0)
            })
            .sum();
        total / bins as f32
    }

    /// Normalised level in `[0, 1]`.
    pub fn level(&mut self, samples: &[f32]) -> f32 {
        (self.byte_energy(samples) / self.divisor).clamp(0.0, 1.0)
    }
}

/// Periodic meter loop publishing [`VolumeEvent`]s while capture is active.
pub struct VolumeMonitor {
    handle: JoinHandle<()>,
    level: Arc<AtomicU32>,
    volume_tx: broadcast::Sender<VolumeEvent>,
    seq: Arc<AtomicU64>,
}

impl VolumeMonitor {
    /// Spawn the loop on the current Tokio runtime.
    ///
    /// With no tap the loop still ticks and publishes `0.0`.
    pub fn spawn(
        tap: Option<VolumeTap>,
        divisor: f32,
        period: Duration,
        volume_tx: broadcast::Sender<VolumeEvent>,
        level: Arc<AtomicU32>,
    ) -> Self {
        let seq = Arc::new(AtomicU64::new(0));
        let handle = {
            let volume_tx = volume_tx.clone();
            let level = Arc::clone(&level);
            let seq = Arc::clone(&seq);
            tokio::spawn(async move {
                let mut meter = LevelMeter::new(divisor);
                let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let value = tap
                        .as_ref()
                        .and_then(VolumeTap::snapshot)
                        .map(|samples| meter.level(&samples))
                        .unwrap_or(0.0);
                    publish(&volume_tx, &level, &seq, value);
                }
            })
        };
        debug!(period_ms = period.as_millis() as u64, "volume monitor started");
        Self {
            handle,
            level,
            volume_tx,
            seq,
        }
    }

    /// Cancel the loop and publish a final `0.0`.
    pub fn stop(self) {
        self.handle.abort();
        publish(&self.volume_tx, &self.level, &self.seq, 0.0);
        debug!("volume monitor stopped");
    }
}

fn publish(
    tx: &broadcast::Sender<VolumeEvent>,
    level: &AtomicU32,
    seq: &AtomicU64,
    value: f32,
) {
    level.store(value.to_bits(), Ordering::Relaxed);
    let _ = tx.send(VolumeEvent {
        seq: seq.fetch_add(1, Ordering::Relaxed),
        level: value,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * 1_000.0 * i as f32 / 16_000.0).sin())
            .collect()
    }

    #[test]
    fn silence_reads_zero() {
        let mut meter = LevelMeter::new(50.0);
        assert_eq!(meter.level(&vec![0.0; FFT_SIZE]), 0.0);
        assert_eq!(meter.level(&[]), 0.0);
    }

    #[test]
    fn louder_signal_reads_higher_and_clamps_at_one() {
        let mut meter = LevelMeter::new(50.0);
        let quiet = meter.level(&sine(0.001, 512));
        let loud = meter.level(&sine(0.8, 512));
        assert!(loud > quiet, "loud={loud} quiet={quiet}");
        assert!(loud <= 1.0);

        let mut hot = LevelMeter::new(1.0);
        assert_eq!(hot.level(&sine(0.8, 512)), 1.0);
    }

    #[test]
    fn tap_keeps_only_the_latest_window() {
        let tap = VolumeTap::default();
        assert!(tap.snapshot().is_none());

        tap.publish(&vec![0.1; FFT_SIZE]);
        tap.publish(&[0.9; 10]);
        let window = tap.snapshot().expect("window after publish");
        assert_eq!(window.len(), FFT_SIZE);
        assert_eq!(window[FFT_SIZE - 1], 0.9);
        assert_eq!(window[FFT_SIZE - 11], 0.1);

        tap.clear();
        assert!(tap.snapshot().is_none());
    }

    #[tokio::test]
    async fn monitor_without_tap_publishes_zero_and_stops_cleanly() {
        let (tx, mut rx) = broadcast::channel(16);
        let level = Arc::new(AtomicU32::new(0.5f32.to_bits()));
        let monitor = VolumeMonitor::spawn(
            None,
            50.0,
            Duration::from_millis(5),
            tx,
            Arc::clone(&level),
        );

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("monitor tick")
            .expect("volume event");
        assert_eq!(event.level, 0.0);

        monitor.stop();
        assert_eq!(f32::from_bits(level.load(Ordering::Relaxed)), 0.0);
    }

    #[tokio::test]
    async fn monitor_reads_from_tap() {
        let (tx, mut rx) = broadcast::channel(64);
        let tap = VolumeTap::default();
        tap.publish(&sine(0.8, FFT_SIZE));
        let monitor = VolumeMonitor::spawn(
            Some(tap),
            50.0,
            Duration::from_millis(5),
            tx,
            Arc::new(AtomicU32::new(0)),
        );

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("monitor tick")
            .expect("volume event");
        assert!(event.level > 0.0);
        monitor.stop();
    }
}
