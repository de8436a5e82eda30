//! Engine configuration
//!
//! Everything here is environment-driven; none of it is part of the wire
//! protocol. Defaults match the original backend deployment (16kHz mono
//! input, backend on port 8001).

use crate::error::{VoiceError, VoiceResult};
use std::time::Duration;

/// Configuration for the voice session engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the STT/TTS backend service (default: http://127.0.0.1:8001).
    pub backend_url: String,

    /// Maximum size of a single inbound audio chunk in bytes (default: 64 KiB).
    /// Oversized chunks are rejected whole, never truncated.
    pub max_chunk_bytes: usize,

    /// Idle time after which a session is torn down (default: 120s).
    pub idle_timeout: Duration,

    /// If the deep response is not ready within this window after the final
    /// transcript, a fast acknowledgment is spoken first (default: 700ms).
    pub fast_ack_threshold: Duration,

    /// Outbound TTS audio is re-framed into pieces of this size (default: 8 KiB)
    /// to bound time-to-first-audio regardless of backend framing.
    pub playback_chunk_bytes: usize,

    /// Short utterances used as fast acknowledgments, rotated per turn.
    pub fast_ack_phrases: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8001".to_string(),
            max_chunk_bytes: 64 * 1024,
            idle_timeout: Duration::from_secs(120),
            fast_ack_threshold: Duration::from_millis(700),
            playback_chunk_bytes: 8 * 1024,
            fast_ack_phrases: vec![
                "Mm-hmm, one moment.".to_string(),
                "Let me think about that.".to_string(),
                "Good question.".to_string(),
            ],
        }
    }
}

impl EngineConfig {
    /// Build from environment: VOICE_BACKEND_URL, VOICE_MAX_CHUNK_BYTES,
    /// VOICE_IDLE_TIMEOUT_SECS, VOICE_FAST_ACK_THRESHOLD_MS. Unset variables
    /// fall back to defaults; unparsable values are a config error.
    pub fn from_env() -> VoiceResult<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("VOICE_BACKEND_URL") {
            let url = url.trim().trim_end_matches('/').to_string();
            if url.is_empty() {
                return Err(VoiceError::Config("VOICE_BACKEND_URL is empty".to_string()));
            }
            config.backend_url = url;
        }
        if let Ok(v) = std::env::var("VOICE_MAX_CHUNK_BYTES") {
            config.max_chunk_bytes = v
                .trim()
                .parse()
                .map_err(|_| VoiceError::Config(format!("bad VOICE_MAX_CHUNK_BYTES: {v}")))?;
        }
        if let Ok(v) = std::env::var("VOICE_IDLE_TIMEOUT_SECS") {
            let secs: u64 = v
                .trim()
                .parse()
                .map_err(|_| VoiceError::Config(format!("bad VOICE_IDLE_TIMEOUT_SECS: {v}")))?;
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Ok(v) = std::env::var("VOICE_FAST_ACK_THRESHOLD_MS") {
            let ms: u64 = v
                .trim()
                .parse()
                .map_err(|_| VoiceError::Config(format!("bad VOICE_FAST_ACK_THRESHOLD_MS: {v}")))?;
            config.fast_ack_threshold = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> VoiceResult<()> {
        if self.max_chunk_bytes == 0 {
            return Err(VoiceError::Config("max_chunk_bytes must be > 0".to_string()));
        }
        if self.playback_chunk_bytes == 0 {
            return Err(VoiceError::Config(
                "playback_chunk_bytes must be > 0".to_string(),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(VoiceError::Config("idle_timeout must be > 0".to_string()));
        }
        Ok(())
    }
}
