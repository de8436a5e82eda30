//! # Parley Voice - Real-Time Voice Session Engine
//!
//! This crate implements the session engine for real-time voice interaction:
//! streamed microphone audio in, transcription and reasoning in the middle,
//! synthesized audio back out, with user barge-in honored at any point while
//! the agent is speaking.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Session Manager                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────────┐  │
//! │  │ Audio Codec  │→ │   Session    │→ │  Speech Bridge    │  │
//! │  │ (WS frames)  │  │ (turn FSM)   │  │  (STT/TTS HTTP)   │  │
//! │  └──────────────┘  └──────────────┘  └───────────────────┘  │
//! │         ↑                  ↓                    ↓            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────────┐  │
//! │  │  Audio Out   │← │ Orchestrator │← │ Reasoning Backend │  │
//! │  │ (playback)   │  │ (fast-ack /  │  │  (deep response)  │  │
//! │  │              │  │  supersede)  │  │                   │  │
//! │  └──────────────┘  └──────────────┘  └───────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The session state machine (`turn`) arbitrates who holds the floor; the
//! orchestrator covers reasoning latency with fast acknowledgments and
//! supersedes them when the deep response lands; a barge-in cancels
//! synthesis and carries a structured [`InterruptionEvent`] into the next
//! reasoning request.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod manager;
pub mod orchestrator;
pub mod protocol;
pub mod session;
pub mod turn;

pub use bridge::{
    BackendHealth, HttpSpeechBackend, PlaceholderBackend, SpeechBackend, SynthesisStream,
    Transcript,
};
pub use codec::{build_wav, decode_audio_message, encode_audio_message};
pub use config::EngineConfig;
pub use error::{VoiceError, VoiceResult};
pub use manager::{SessionConnection, SessionManager};
pub use orchestrator::{
    CommittedUtterance, HistoryEntry, HistoryRole, HttpReasoningBackend, InterruptionContext,
    OrchestratorConfig, PlaceholderReasoning, ReasoningBackend, ReasoningRequest,
    ResponseOrchestrator, TierKind, TurnRecord,
};
pub use protocol::{ClientMessage, ServerMessage, VoiceParams, WireMessage};
pub use session::{Session, SessionEvent, SessionId};
pub use turn::{InterruptionEvent, PlaybackProgress, SessionState};
