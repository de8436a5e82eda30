//! Error types for the voice session engine

use thiserror::Error;

/// Result type alias for voice session operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice session engine.
///
/// Variants that reach the client carry a stable machine-readable code via
/// [`VoiceError::code`]; backend failures terminate only the current turn,
/// never the session.
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("message `{message}` not allowed in state {state}")]
    ProtocolState {
        state: &'static str,
        message: &'static str,
    },

    #[error("audio chunk of {size} bytes exceeds maximum of {max} bytes")]
    ChunkTooLarge { size: usize, max: usize },

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("synthesis failed: {0}")]
    Synthesis(String),

    #[error("reasoning backend failed: {0}")]
    Reasoning(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("channel send error: {0}")]
    ChannelSend(String),

    #[error("backend unreachable: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Stable wire code for the `error{code}` message.
    pub fn code(&self) -> &'static str {
        match self {
            VoiceError::ProtocolState { .. } => "protocol_state",
            VoiceError::ChunkTooLarge { .. } => "chunk_too_large",
            VoiceError::Transcription(_) => "transcription_failed",
            VoiceError::Synthesis(_) => "synthesis_failed",
            VoiceError::Reasoning(_) => "reasoning_failed",
            VoiceError::ConnectionLost(_) => "connection_lost",
            VoiceError::Frame(_) => "malformed_frame",
            VoiceError::Config(_) => "config",
            VoiceError::ChannelSend(_) => "channel_send",
            VoiceError::Backend(_) => "backend_unreachable",
            VoiceError::Io(_) => "io",
        }
    }

    /// Whether the failure ends only the current turn (session returns to
    /// Idle) rather than the connection.
    pub fn is_turn_local(&self) -> bool {
        !matches!(
            self,
            VoiceError::ConnectionLost(_) | VoiceError::ChannelSend(_)
        )
    }
}
