//! PCM16 transport codec.
//!
//! Outbound: f32 samples in [-1, 1] → signed 16-bit little-endian PCM →
//! base64 envelope tagged `audio/pcm;rate=<hz>`.
//!
//! Inbound: envelope → raw bytes → de-interleaved f32 channels at the
//! playback rate.
//!
//! Everything here is synchronous and allocation-bounded by the payload; it
//! never runs on a real-time audio thread.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::{
    buffering::frame::{AudioFrame, PlaybackBuffer},
    error::{Result, VoxlinkError},
};

/// Bytes per PCM16 sample.
pub const PCM16_SAMPLE_WIDTH: usize = 2;

/// Encode scale: full-scale input maps to ±32767.
const PCM16_ENCODE_SCALE: f32 = 32_767.0;

/// Decode divisor.
const PCM16_DECODE_SCALE: f32 = 32_768.0;

/// A transport-encoded chunk of audio. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedAudioBlob {
    data: String,
    mime_type: String,
}

impl EncodedAudioBlob {
    pub fn new(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Wrap raw PCM16 bytes in the base64 envelope.
    pub fn from_pcm16(bytes: &[u8], sample_rate: u32) -> Self {
        Self::new(STANDARD.encode(bytes), pcm_mime_type(sample_rate))
    }

    /// Base64 payload.
    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Sample rate declared by the `rate=` parameter of the mime tag, if any.
    pub fn declared_sample_rate(&self) -> Option<u32> {
        self.mime_type
            .split(';')
            .filter_map(|param| param.trim().strip_prefix("rate="))
            .find_map(|rate| rate.trim().parse().ok())
    }
}

/// Mime tag for mono PCM16 at `sample_rate`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

/// Quantise one sample: `round(clamp(s, -1, 1) * 32767)`, ties away from zero.
///
/// Non-finite input maps to silence.
#[inline]
pub fn quantize_sample(sample: f32) -> i16 {
    if !sample.is_finite() {
        return 0;
    }
    (sample.clamp(-1.0, 1.0) * PCM16_ENCODE_SCALE).round() as i16
}

/// Pack samples as little-endian PCM16.
pub fn pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * PCM16_SAMPLE_WIDTH);
    for &s in samples {
        out.extend_from_slice(&quantize_sample(s).to_le_bytes());
    }
    out
}

/// Encode a captured frame for outbound transmission.
pub fn encode_frame(frame: &AudioFrame) -> EncodedAudioBlob {
    EncodedAudioBlob::from_pcm16(&pcm16_bytes(&frame.samples), frame.sample_rate)
}

/// Undo the transport envelope.
///
/// # Errors
/// `VoxlinkError::MalformedBlob` when the payload is not valid base64.
pub fn decode_blob_bytes(blob: &EncodedAudioBlob) -> Result<Vec<u8>> {
    STANDARD
        .decode(blob.data.trim())
        .map_err(|e| VoxlinkError::MalformedBlob(e.to_string()))
}

/// Interpret `bytes` as interleaved PCM16 LE and build a playback buffer.
///
/// A trailing partial frame (fewer samples than `channels`) is ignored.
///
/// # Errors
/// `VoxlinkError::MalformedAudio` when the byte length is not a multiple of the
/// sample width, or `channels`/`sample_rate` is zero.
pub fn decode_to_audio_buffer(
    bytes: &[u8],
    sample_rate: u32,
    channels: u16,
) -> Result<PlaybackBuffer> {
    if channels == 0 || sample_rate == 0 {
        return Err(VoxlinkError::MalformedAudio(format!(
            "invalid layout: {channels} channel(s) @ {sample_rate} Hz"
        )));
    }
    if bytes.len() % PCM16_SAMPLE_WIDTH != 0 {
        return Err(VoxlinkError::MalformedAudio(format!(
            "{} bytes is not a whole number of 16-bit samples",
            bytes.len()
        )));
    }

    let ch = channels as usize;
    let frame_count = bytes.len() / PCM16_SAMPLE_WIDTH / ch;
    let mut planes = vec![Vec::with_capacity(frame_count); ch];

    for (idx, pair) in bytes
        .chunks_exact(PCM16_SAMPLE_WIDTH)
        .take(frame_count * ch)
        .enumerate()
    {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        planes[idx % ch].push(value as f32 / PCM16_DECODE_SCALE);
    }

    Ok(PlaybackBuffer::new(planes, sample_rate))
}

/// Full inbound path: envelope → bytes → buffer.
pub fn decode_blob(
    blob: &EncodedAudioBlob,
    sample_rate: u32,
    channels: u16,
) -> Result<PlaybackBuffer> {
    let bytes = decode_blob_bytes(blob)?;
    decode_to_audio_buffer(&bytes, sample_rate, channels)
}
