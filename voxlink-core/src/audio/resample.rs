//! Sample-rate conversion using rubato `FastFixedIn` resamplers.
//!
//! ## Design
//!
//! Two directions need conversion:
//!
//! - **Capture**: `cpal` records at the device's native rate (commonly 48 kHz).
//!   The transport wants 16 kHz mono. `RateConverter` streams that conversion
//!   on the capture worker thread, where allocation is allowed.
//! - **Playback**: inbound speech is 24 kHz; the output device runs at its own
//!   rate. `resample_buffer` converts one whole decoded buffer at a time and
//!   pins the output length to the buffer's duration so scheduled voices stay
//!   gapless on the device timeline.
//!
//! When rates are equal both paths are passthrough and no rubato session is
//! created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{Result, VoxlinkError};

/// Converts f32 mono audio from one fixed sample rate to another, streaming.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Accumulation buffer; holds partial input chunks between calls.
    input_buf: Vec<f32>,
    /// How many input samples rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// # Parameters
    /// - `source_rate`: Sample rate of the incoming audio (Hz).
    /// - `target_rate`: Sample rate wanted downstream (Hz).
    /// - `chunk_size`: Input frame count per rubato call (e.g. `960`).
    ///
    /// # Errors
    /// Returns `VoxlinkError::AudioDevice` if rubato fails to initialise.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let resampler = new_resampler(source_rate, target_rate, chunk_size)?;
        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        tracing::info!(
            source_rate,
            target_rate,
            chunk_size,
            max_out,
            "capture resampling enabled"
        );

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
        })
    }

    /// Process incoming samples, returning resampled output (may be empty).
    ///
    /// Samples are accumulated internally until a full `chunk_size` block is
    /// available for rubato. Any remainder is kept for the next call.
    ///
    /// In passthrough mode (same rates), input is returned directly.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();

        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];

            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }

            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Returns `true` when source rate == target rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Drop any partially accumulated input.
    pub fn reset(&mut self) {
        self.input_buf.clear();
        if let Some(ref mut resampler) = self.resampler {
            resampler.reset();
        }
    }
}

/// Convert one complete mono buffer from `source_rate` to `target_rate`.
///
/// The result always holds exactly `round(len * target / source)` samples:
/// rubato's filter delay is absorbed by zero-padding or truncating the tail.
///
/// # Errors
/// Returns `VoxlinkError::AudioStream` if rubato rejects the buffer.
pub fn resample_buffer(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
    if source_rate == target_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let expected =
        (samples.len() as f64 * target_rate as f64 / source_rate as f64).round() as usize;

    let mut resampler = new_resampler(source_rate, target_rate, samples.len())?;
    let mut planes = resampler
        .process(&[samples], None)
        .map_err(|e| VoxlinkError::AudioStream(format!("resample: {e}")))?;

    let mut out = if planes.is_empty() {
        Vec::new()
    } else {
        planes.swap_remove(0)
    };
    out.resize(expected, 0.0);
    Ok(out)
}

fn new_resampler(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<FastFixedIn<f32>> {
    let ratio = target_rate as f64 / source_rate as f64;
    FastFixedIn::<f32>::new(
        ratio,
        1.0, // fixed ratio, no dynamic adjustment
        PolynomialDegree::Cubic,
        chunk_size,
        1, // mono
    )
    .map_err(|e| VoxlinkError::AudioDevice(format!("resampler init: {e}")))
}
