//! Wire protocol message set
//!
//! Control messages travel as JSON text frames; audio payloads travel as
//! binary frames (see `codec`). The message set is closed: adding a message
//! type is a compile-time-checked change because every dispatch site matches
//! exhaustively.

use serde::{Deserialize, Serialize};

/// A transport frame, before protocol decoding. The transport (websocket or
/// otherwise) only needs to distinguish text from binary.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// TTS voice style parameters, carried through to the synthesis backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoiceParams {
    /// Emotional exaggeration, 0.0..=1.0.
    #[serde(default = "default_style")]
    pub exaggeration: f32,
    /// Classifier-free guidance weight, 0.0..=1.0.
    #[serde(default = "default_style")]
    pub cfg_weight: f32,
}

fn default_style() -> f32 {
    0.5
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            exaggeration: 0.5,
            cfg_weight: 0.5,
        }
    }
}

impl VoiceParams {
    /// Clamp both parameters into their valid range.
    pub fn clamped(mut self) -> Self {
        self.exaggeration = self.exaggeration.clamp(0.0, 1.0);
        self.cfg_weight = self.cfg_weight.clamp(0.0, 1.0);
        self
    }
}

/// Client → server control messages. `audio_chunk` is not here: chunk
/// payloads arrive as binary frames and are decoded by the codec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    AudioStart {
        sample_rate: u32,
        channels: u16,
    },
    AudioEnd {},
    Synthesize {
        text: String,
        #[serde(default)]
        voice_params: Option<VoiceParams>,
    },
    Ping {},
}

/// Server → client messages. Audio payloads go out as binary frames; the
/// JSON `audio_start`/`audio_end` pair brackets each synthesized utterance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ready {},
    Transcription {
        text: String,
        language: String,
        is_final: bool,
    },
    AudioStart {
        sample_rate: u32,
    },
    AudioEnd {
        duration_seconds: f64,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Pong {},
}

impl ClientMessage {
    /// Parse a JSON text frame. Unknown or malformed payloads are a frame
    /// error, not a connection error.
    pub fn parse(text: &str) -> Result<Self, String> {
        serde_json::from_str(text).map_err(|e| format!("invalid message payload: {e}"))
    }
}

impl ServerMessage {
    /// Encode as a JSON text frame.
    pub fn to_wire(&self) -> WireMessage {
        // ServerMessage contains no map keys or non-string values that can fail.
        WireMessage::Text(serde_json::to_string(self).expect("server message serializes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_round_trip_tagged() {
        let msg = ClientMessage::parse(r#"{"type":"audio_start","sample_rate":16000,"channels":1}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::AudioStart {
                sample_rate: 16000,
                channels: 1
            }
        );

        let msg = ClientMessage::parse(r#"{"type":"synthesize","text":"hello"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Synthesize {
                text: "hello".to_string(),
                voice_params: None
            }
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(ClientMessage::parse(r#"{"type":"reboot"}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn error_code_is_omitted_when_absent() {
        let wire = ServerMessage::Error {
            message: "nope".to_string(),
            code: None,
        }
        .to_wire();
        match wire {
            WireMessage::Text(t) => assert!(!t.contains("code")),
            WireMessage::Binary(_) => panic!("expected text frame"),
        }
    }

    #[test]
    fn voice_params_clamp() {
        let p = VoiceParams {
            exaggeration: 7.0,
            cfg_weight: -1.0,
        }
        .clamped();
        assert_eq!(p.exaggeration, 1.0);
        assert_eq!(p.cfg_weight, 0.0);
    }
}
