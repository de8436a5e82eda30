//! Turn-taking state machine
//!
//! Governs which protocol messages are legal in which state, and the
//! barge-in transition out of Speaking. The machine itself is pure data;
//! side effects (buffer clearing, cancellation, event construction) are the
//! session's job, keyed off the returned [`Transition`].

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{VoiceError, VoiceResult};

/// Per-session conversational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the user or for a synthesize request.
    Idle,
    /// Receiving an audio turn from the user.
    Listening,
    /// Transcription in flight.
    Processing,
    /// Streaming synthesized audio to the client.
    Speaking,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::Processing => "processing",
            SessionState::Speaking => "speaking",
        }
    }
}

/// The closed set of inputs the machine reacts to. Protocol messages map
/// directly; `TranscriptionDone` and `PlaybackDone` are internal completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnInput {
    AudioStart,
    AudioChunk,
    AudioEnd,
    Synthesize,
    TranscriptionDone,
    PlaybackDone,
}

impl TurnInput {
    pub fn name(self) -> &'static str {
        match self {
            TurnInput::AudioStart => "audio_start",
            TurnInput::AudioChunk => "audio_chunk",
            TurnInput::AudioEnd => "audio_end",
            TurnInput::Synthesize => "synthesize",
            TurnInput::TranscriptionDone => "transcription_done",
            TurnInput::PlaybackDone => "playback_done",
        }
    }
}

/// Outcome of a legal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move to the given state.
    To(SessionState),
    /// Legal input, no state change (e.g. a chunk while Listening).
    Stay,
    /// `audio_start` while Speaking: cancel synthesis, record an
    /// interruption event, then enter Listening.
    BargeIn,
}

/// Validate one input against the current state. Illegal pairs fail with
/// `ProtocolState` and must leave the caller's state untouched.
pub fn transition(state: SessionState, input: TurnInput) -> VoiceResult<Transition> {
    use SessionState::*;
    use TurnInput::*;

    let next = match (state, input) {
        (Idle, AudioStart) => Transition::To(Listening),
        (Listening, AudioChunk) => Transition::Stay,
        (Listening, AudioEnd) => Transition::To(Processing),
        (Processing, TranscriptionDone) => Transition::To(Idle),
        (Idle, Synthesize) => Transition::To(Speaking),
        (Speaking, PlaybackDone) => Transition::To(Idle),
        (Speaking, AudioStart) => Transition::BargeIn,
        (state, input) => {
            return Err(VoiceError::ProtocolState {
                state: state.as_str(),
                message: input.name(),
            })
        }
    };
    Ok(next)
}

/// Created exactly when the user barges in while the agent is Speaking.
/// Never silently discarded: the session threads it into the next turn's
/// reasoning context so the agent's own unfinished response is preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct InterruptionEvent {
    /// The full text the agent had committed to speaking.
    pub intended_response_text: String,
    /// Char offset into `intended_response_text` covering the audio actually
    /// delivered before cancellation. Invariant: `<= char count of text`.
    pub spoken_up_to_offset: usize,
    /// Transcript of what the user said instead; filled once their
    /// interrupting turn has been transcribed.
    pub user_interruption_text: String,
    pub timestamp: DateTime<Utc>,
}

impl InterruptionEvent {
    /// The prefix of the intended text the user actually heard.
    pub fn spoken_prefix(&self) -> &str {
        char_prefix(&self.intended_response_text, self.spoken_up_to_offset)
    }
}

fn char_prefix(text: &str, chars: usize) -> &str {
    match text.char_indices().nth(chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Nominal speaking rate used to map delivered audio time to text position.
const SPOKEN_CHARS_PER_SECOND: f64 = 15.0;

/// Tracks how much of the current utterance has actually been handed to the
/// transport. Shared between the speaking task (writer) and the session
/// (reader, on barge-in).
///
/// The offset is derived from delivered audio, not from how much text the
/// synthesizer has consumed — generation can race ahead of playback.
#[derive(Debug, Default)]
pub struct PlaybackProgress {
    text: Mutex<String>,
    bytes_sent: AtomicUsize,
    sample_rate: AtomicUsize,
    complete: AtomicBool,
}

impl PlaybackProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the previous utterance. Call at the start of a new speaking
    /// turn, before any synthesis begins, so a barge-in that lands while
    /// reasoning is still in flight does not see the prior turn's text.
    pub fn reset(&self) {
        self.begin_utterance("", 0);
    }

    /// Start tracking a new utterance. Resets counters.
    pub fn begin_utterance(&self, text: &str, sample_rate: u32) {
        let mut guard = self.text.lock().unwrap_or_else(|e| e.into_inner());
        *guard = text.to_string();
        self.bytes_sent.store(0, Ordering::SeqCst);
        self.sample_rate.store(sample_rate as usize, Ordering::SeqCst);
        self.complete.store(false, Ordering::SeqCst);
    }

    /// Record audio bytes delivered to the transport.
    pub fn add_bytes_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n, Ordering::SeqCst);
    }

    /// Mark the utterance fully streamed.
    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::SeqCst);
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    /// Seconds of 16-bit mono PCM delivered so far.
    pub fn seconds_sent(&self) -> f64 {
        let rate = self.sample_rate.load(Ordering::SeqCst) as u32;
        crate::codec::pcm_duration_seconds(self.bytes_sent.load(Ordering::SeqCst), rate, 1)
    }

    /// Snapshot the utterance text and the estimated spoken char offset.
    ///
    /// Policy: the server cannot observe the client's playhead, so "spoken"
    /// is approximated as bytes handed to the transport converted to seconds
    /// and mapped through a nominal speaking rate. A completed stream always
    /// reports the full text.
    pub fn snapshot(&self) -> (String, usize) {
        let text = self
            .text
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let char_count = text.chars().count();
        if self.complete.load(Ordering::SeqCst) {
            return (text, char_count);
        }
        let estimated = (self.seconds_sent() * SPOKEN_CHARS_PER_SECOND).floor() as usize;
        let offset = estimated.min(char_count);
        (text, offset)
    }
}
