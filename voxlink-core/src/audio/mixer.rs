//! Sample-accurate voice mixer rendered inside the output callback.
//!
//! Each scheduled buffer becomes a `Voice` that starts at an absolute frame
//! on the device timeline. `render` fills one callback period, advancing the
//! frame position that doubles as the output clock.
//!
//! The mixer never allocates or frees while rendering. Voices arrive fully
//! built through [`MixerCommand`], the voice list is sized once to
//! [`MAX_VOICES`], and every buffer leaving the mixer is handed back through
//! a [`MixerEvent`] so it is dropped off the audio thread.

use crate::audio::SourceId;

/// Voices the mixer holds at once. Further schedules are rejected.
pub const MAX_VOICES: usize = 256;

/// Instructions sent from the control side into the render callback.
#[derive(Debug)]
pub enum MixerCommand {
    /// Start `samples` (mono, device rate) at absolute frame `start_frame`.
    Schedule {
        id: SourceId,
        samples: Vec<f32>,
        start_frame: u64,
    },
    /// Silence one voice immediately. Unknown ids are ignored.
    Stop { id: SourceId },
    /// Silence every voice immediately.
    StopAll,
}

/// A voice leaving the mixer, with its samples to free elsewhere.
#[derive(Debug)]
pub enum MixerEvent {
    /// Played to its last frame.
    Ended { id: SourceId, samples: Vec<f32> },
    /// Silenced by `Stop` or `StopAll`; not a completion.
    Stopped { samples: Vec<f32> },
    /// Never started because the mixer was full.
    Rejected { id: SourceId, samples: Vec<f32> },
}

impl MixerEvent {
    /// Id to report as finished to the scheduler, if any.
    pub fn finished_id(&self) -> Option<SourceId> {
        match self {
            MixerEvent::Ended { id, .. } | MixerEvent::Rejected { id, .. } => Some(*id),
            MixerEvent::Stopped { .. } => None,
        }
    }
}

#[derive(Debug)]
struct Voice {
    id: SourceId,
    samples: Vec<f32>,
    start_frame: u64,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Mixes scheduled voices onto an interleaved output buffer.
#[derive(Debug)]
pub struct Mixer {
    voices: Vec<Voice>,
    /// Absolute device frame of the next sample to render.
    position: u64,
}

impl Default for Mixer {
    fn default() -> Self {
        Self::new()
    }
}

impl Mixer {
    pub fn new() -> Self {
        Self {
            voices: Vec::with_capacity(MAX_VOICES),
            position: 0,
        }
    }

    /// Absolute frame position (frames rendered so far).
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    pub fn apply(&mut self, command: MixerCommand, mut retire: impl FnMut(MixerEvent)) {
        match command {
            MixerCommand::Schedule {
                id,
                samples,
                start_frame,
            } => {
                if self.voices.len() >= MAX_VOICES {
                    retire(MixerEvent::Rejected { id, samples });
                } else {
                    self.voices.push(Voice {
                        id,
                        samples,
                        start_frame,
                    });
                }
            }
            MixerCommand::Stop { id } => {
                if let Some(idx) = self.voices.iter().position(|v| v.id == id) {
                    let voice = self.voices.remove(idx);
                    retire(MixerEvent::Stopped {
                        samples: voice.samples,
                    });
                }
            }
            MixerCommand::StopAll => {
                for voice in self.voices.drain(..) {
                    retire(MixerEvent::Stopped {
                        samples: voice.samples,
                    });
                }
            }
        }
    }

    /// Render one period into interleaved `out` with `channels` channels.
    ///
    /// Voices that reach their last frame during this period are removed and
    /// passed to `retire` in start order. A voice scheduled in the past
    /// plays from its current offset rather than from the beginning.
    pub fn render(&mut self, out: &mut [f32], channels: usize, mut retire: impl FnMut(MixerEvent)) {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        out.fill(0.0);

        let period_start = self.position;
        let period_end = period_start + frames as u64;

        for voice in &self.voices {
            let from = voice.start_frame.max(period_start);
            let to = voice.end_frame().min(period_end);
            if from >= to {
                continue;
            }
            for frame in from..to {
                let sample = voice.samples[(frame - voice.start_frame) as usize];
                let base = (frame - period_start) as usize * channels;
                for slot in &mut out[base..base + channels] {
                    *slot += sample;
                }
            }
        }

        for slot in out.iter_mut() {
            *slot = slot.clamp(-1.0, 1.0);
        }

        self.position = period_end;

        let mut idx = 0;
        while idx < self.voices.len() {
            if self.voices[idx].end_frame() <= period_end {
                let voice = self.voices.remove(idx);
                retire(MixerEvent::Ended {
                    id: voice.id,
                    samples: voice.samples,
                });
            } else {
                idx += 1;
            }
        }
    }
}
