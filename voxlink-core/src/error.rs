use thiserror::Error;

/// All errors produced by voxlink-core.
#[derive(Debug, Error)]
pub enum VoxlinkError {
    #[error("microphone access denied: {0}")]
    MicrophonePermission(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("malformed audio blob: {0}")]
    MalformedBlob(String),

    #[error("malformed audio payload: {0}")]
    MalformedAudio(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("a call is already connecting or active")]
    AlreadyInCall,

    #[error("remote session is not open")]
    SessionNotOpen,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VoxlinkError {
    /// Whether this error belongs to a single inbound chunk and is recovered
    /// locally instead of ending the call.
    pub fn is_chunk_local(&self) -> bool {
        matches!(
            self,
            VoxlinkError::MalformedBlob(_) | VoxlinkError::MalformedAudio(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VoxlinkError>;
