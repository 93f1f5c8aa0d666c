//! Gapless playback scheduling and barge-in.
//!
//! The scheduler owns a single cursor on the output clock and the set of
//! buffers that have been handed to the device but have not finished. It is
//! driven only from the call loop, so neither needs a lock.
//!
//! ```text
//! start(n+1) = max(cursor, output.now)      cursor += duration(n+1)
//! interrupt:  stop every in-flight id, clear the set, cursor = output.now
//! ```

use std::collections::BTreeSet;

use tracing::debug;

use crate::{
    audio::{PlaybackOutput, SourceId},
    codec::{decode_blob, EncodedAudioBlob},
    error::Result,
};

/// Where and when a decoded chunk was placed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub id: SourceId,
    /// Start on the output clock (seconds).
    pub start_at: f64,
    pub duration: f64,
}

#[derive(Debug)]
pub struct PlaybackScheduler {
    sample_rate: u32,
    channels: u16,
    cursor: f64,
    in_flight: BTreeSet<SourceId>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            cursor: 0.0,
            in_flight: BTreeSet::new(),
            next_id: 0,
        }
    }

    /// Next free start time on the output clock.
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, id: SourceId) -> bool {
        self.in_flight.contains(&id)
    }

    /// Decode `blob` and schedule it right after everything already queued.
    ///
    /// On error nothing is registered and the cursor does not move; the
    /// caller decides whether the error is local to this chunk.
    pub fn enqueue(
        &mut self,
        blob: &EncodedAudioBlob,
        output: &mut dyn PlaybackOutput,
    ) -> Result<ScheduledChunk> {
        let buffer = decode_blob(blob, self.sample_rate, self.channels)?;
        let duration = buffer.duration_secs();
        let start_at = self.cursor.max(output.current_time());
        let id = SourceId(self.next_id);

        output.schedule(id, buffer, start_at)?;

        self.next_id += 1;
        self.in_flight.insert(id);
        self.cursor = start_at + duration;
        debug!(%id, start_at, duration, in_flight = self.in_flight.len(), "chunk scheduled");

        Ok(ScheduledChunk {
            id,
            start_at,
            duration,
        })
    }

    /// A buffer played to its end. Unknown ids (already stopped) are ignored.
    pub fn on_ended(&mut self, id: SourceId) -> bool {
        self.in_flight.remove(&id)
    }

    /// Barge-in: silence everything queued or playing and restart from now.
    ///
    /// Returns how many buffers were stopped.
    pub fn interrupt(&mut self, output: &mut dyn PlaybackOutput) -> usize {
        let stopped = self.in_flight.len();
        for id in std::mem::take(&mut self.in_flight) {
            output.stop(id);
        }
        self.cursor = output.current_time();
        stopped
    }

    /// Forget every buffer and rewind the cursor without touching a device.
    pub fn reset(&mut self) {
        self.in_flight.clear();
        self.cursor = 0.0;
    }
}
