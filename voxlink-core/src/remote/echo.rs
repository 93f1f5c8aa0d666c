//! Loopback endpoint that speaks back whatever it hears.
//!
//! Opens after a short delay, then answers every uplink blob with the same
//! audio converted to the playback rate. Closing the uplink ends the session
//! with a normal `Close`. Useful for exercising the whole engine without a
//! hosted service.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    audio::resample::resample_buffer,
    codec::{decode_blob, pcm16_bytes, EncodedAudioBlob},
    error::{Result, VoxlinkError},
    remote::{
        AudioUplink, RemoteEvent, RemoteEventSender, ServerMessage, SessionConfig,
        SessionConnector,
    },
};

/// Rate assumed for uplink blobs whose mime tag carries no `rate=`.
const DEFAULT_UPLINK_RATE: u32 = 16_000;

#[derive(Debug, Clone)]
pub struct EchoConnector {
    open_delay: Duration,
    reply_rate: u32,
}

impl Default for EchoConnector {
    fn default() -> Self {
        Self {
            open_delay: Duration::from_millis(150),
            reply_rate: 24_000,
        }
    }
}

impl EchoConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn with_reply_rate(mut self, rate: u32) -> Self {
        self.reply_rate = rate;
        self
    }
}

impl SessionConnector for EchoConnector {
    fn connect(
        &self,
        config: &SessionConfig,
        events: RemoteEventSender,
    ) -> Result<Box<dyn AudioUplink>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| VoxlinkError::Connection(format!("no async runtime: {e}")))?;

        info!(model = %config.model, voice = %config.voice, "echo session opening");

        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_session(rx, events, self.open_delay, self.reply_rate));

        Ok(Box::new(EchoUplink { tx: Some(tx) }))
    }
}

struct EchoUplink {
    tx: Option<mpsc::UnboundedSender<EncodedAudioBlob>>,
}

impl AudioUplink for EchoUplink {
    fn send_audio(&mut self, blob: EncodedAudioBlob) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(VoxlinkError::SessionNotOpen)?;
        tx.send(blob)
            .map_err(|_| VoxlinkError::Connection("echo session is gone".into()))
    }

    fn close(&mut self) {
        self.tx.take();
    }
}

async fn run_session(
    mut uplink: mpsc::UnboundedReceiver<EncodedAudioBlob>,
    events: RemoteEventSender,
    open_delay: Duration,
    reply_rate: u32,
) {
    tokio::time::sleep(open_delay).await;
    if events.send(RemoteEvent::Open).is_err() {
        return;
    }
    debug!("echo session open");

    while let Some(blob) = uplink.recv().await {
        match echo_reply(&blob, reply_rate) {
            Ok(reply) => {
                if events
                    .send(RemoteEvent::Message(ServerMessage::audio(reply)))
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => warn!("echo session skipped an uplink blob: {e}"),
        }
    }

    let _ = events.send(RemoteEvent::Close {
        reason: Some("uplink closed".into()),
    });
    debug!("echo session closed");
}

fn echo_reply(blob: &EncodedAudioBlob, reply_rate: u32) -> Result<EncodedAudioBlob> {
    let rate = blob.declared_sample_rate().unwrap_or(DEFAULT_UPLINK_RATE);
    let samples = decode_blob(blob, rate, 1)?.into_mono();
    let converted = resample_buffer(&samples, rate, reply_rate)?;
    Ok(EncodedAudioBlob::from_pcm16(&pcm16_bytes(&converted), reply_rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{buffering::frame::AudioFrame, codec::encode_frame, remote::RemoteEventReceiver};

    async fn next_event(rx: &mut RemoteEventReceiver) -> RemoteEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for remote event")
            .expect("remote event channel closed")
    }

    fn session_config() -> SessionConfig {
        SessionConfig {
            model: "echo".into(),
            system_instruction: String::new(),
            voice: "none".into(),
        }
    }

    #[tokio::test]
    async fn opens_then_echoes_at_reply_rate_then_closes() {
        let connector = EchoConnector::new().with_open_delay(Duration::from_millis(5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut uplink = connector
            .connect(&session_config(), tx)
            .expect("connect echo");

        assert_eq!(next_event(&mut rx).await, RemoteEvent::Open);

        let frame = AudioFrame::new(vec![0.25; 1_600], 16_000);
        uplink.send_audio(encode_frame(&frame)).expect("send frame");

        match next_event(&mut rx).await {
            RemoteEvent::Message(msg) => {
                assert_eq!(msg.audio.len(), 1);
                assert_eq!(msg.audio[0].declared_sample_rate(), Some(24_000));
                let reply = decode_blob(&msg.audio[0], 24_000, 1).expect("decode reply");
                assert_eq!(reply.frame_count(), 2_400);
            }
            other => panic!("expected message, got {other:?}"),
        }

        uplink.close();
        assert!(matches!(
            next_event(&mut rx).await,
            RemoteEvent::Close { .. }
        ));
    }

    #[tokio::test]
    async fn reply_rate_is_configurable() {
        let connector = EchoConnector::new()
            .with_open_delay(Duration::from_millis(1))
            .with_reply_rate(48_000);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut uplink = connector
            .connect(&session_config(), tx)
            .expect("connect echo");
        assert_eq!(next_event(&mut rx).await, RemoteEvent::Open);

        let frame = AudioFrame::new(vec![0.1; 800], 16_000);
        uplink.send_audio(encode_frame(&frame)).expect("send frame");

        let RemoteEvent::Message(msg) = next_event(&mut rx).await else {
            panic!("expected an echoed message");
        };
        assert_eq!(msg.audio[0].declared_sample_rate(), Some(48_000));
        let reply = decode_blob(&msg.audio[0], 48_000, 1).expect("decode reply");
        assert_eq!(reply.frame_count(), 2_400);
        uplink.close();
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let connector = EchoConnector::new().with_open_delay(Duration::from_millis(1));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut uplink = connector
            .connect(&session_config(), tx)
            .expect("connect echo");
        uplink.close();
        uplink.close();
        assert!(uplink
            .send_audio(EncodedAudioBlob::from_pcm16(&[0, 0], 16_000))
            .is_err());
    }

    #[test]
    fn connect_outside_runtime_is_a_connection_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = EchoConnector::new()
            .connect(&session_config(), tx)
            .err()
            .expect("connect without runtime must fail");
        assert!(matches!(err, VoxlinkError::Connection(_)));
    }
}
