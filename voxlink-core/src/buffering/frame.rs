//! Audio containers: captured frames going out, decoded buffers coming in.

/// A fixed-length block of mono capture samples in [-1.0, 1.0].
///
/// Produced by the capture worker at the transport input rate and consumed
/// exactly once by the encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    /// Sample rate in Hz (16000 in the reference cadence).
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Returns the duration of this frame in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Decoded inbound speech, one plane per channel, at the playback rate.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl PlaybackBuffer {
    /// All planes are expected to hold the same number of frames.
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(vec![samples], sample_rate)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frame_count(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn channel(&self, idx: usize) -> &[f32] {
        &self.channels[idx]
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }

    /// Average all planes down to one.
    pub fn into_mono(mut self) -> Vec<f32> {
        match self.channels.len() {
            0 => Vec::new(),
            1 => self.channels.swap_remove(0),
            n => {
                let frames = self.frame_count();
                (0..frames)
                    .map(|f| self.channels.iter().map(|c| c[f]).sum::<f32>() / n as f32)
                    .collect()
            }
        }
    }
}

/// Re-blocks an arbitrary stream of samples into fixed-size frames.
///
/// Leftover samples are carried over to the next `push`; nothing is padded.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_len: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_len: usize, sample_rate: u32) -> Self {
        let frame_len = frame_len.max(1);
        Self {
            frame_len,
            sample_rate,
            pending: Vec::with_capacity(frame_len * 2),
        }
    }

    /// Append samples and drain every complete frame, in order.
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(AudioFrame)) {
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= self.frame_len {
            let rest = self.pending.split_off(self.frame_len);
            let full = std::mem::replace(&mut self.pending, rest);
            emit(AudioFrame::new(full, self.sample_rate));
        }
    }

    /// Samples waiting for the next frame boundary.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
