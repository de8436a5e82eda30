//! Per-connection session
//!
//! One `Session` per connected user. Inbound wire messages are handled
//! strictly sequentially; backend calls run in a spawned per-turn task so a
//! barge-in `audio_start` is still observed while Speaking. Completions come
//! back as [`SessionEvent`]s on the channel returned by [`Session::new`],
//! and must be fed to [`Session::handle_event`] by the same driver loop —
//! that single-consumer discipline is what gives each session its
//! sequential ordering.

use crate::bridge::{SpeechBackend, Transcript};
use crate::codec;
use crate::config::EngineConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::orchestrator::{
    HistoryEntry, HistoryRole, ReasoningBackend, ReasoningRequest, ResponseOrchestrator,
    TurnRecord,
};
use crate::protocol::{ClientMessage, ServerMessage, VoiceParams, WireMessage};
use crate::turn::{
    transition, InterruptionEvent, PlaybackProgress, SessionState, Transition, TurnInput,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type SessionId = Uuid;

const MAX_HISTORY_ENTRIES: usize = 20;

/// Completion notifications from per-turn tasks.
#[derive(Debug)]
pub enum SessionEvent {
    TranscriptionFinished(VoiceResult<Transcript>),
    SpeakingFinished(VoiceResult<TurnRecord>),
}

/// Buffered audio for the current listening turn. Non-empty only while
/// Listening; flushed to empty exactly at the Listening→Processing
/// transition.
#[derive(Debug, Default)]
struct AudioInBuffer {
    chunks: Vec<Vec<u8>>,
    sample_rate: u32,
    channels: u16,
}

impl AudioInBuffer {
    fn reset(&mut self, sample_rate: u32, channels: u16) {
        self.chunks.clear();
        self.sample_rate = sample_rate;
        self.channels = channels;
    }

    fn byte_len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    /// Concatenate and clear, preserving arrival order.
    fn flush(&mut self) -> Vec<u8> {
        let mut pcm = Vec::with_capacity(self.byte_len());
        for chunk in self.chunks.drain(..) {
            pcm.extend_from_slice(&chunk);
        }
        pcm
    }
}

enum PendingTurn {
    Transcribing(JoinHandle<()>),
    Speaking(JoinHandle<()>),
}

/// One connected user's conversation.
pub struct Session {
    pub id: SessionId,
    pub user_id: Option<String>,
    state: SessionState,
    audio_in: AudioInBuffer,
    pending: Option<PendingTurn>,
    last_activity: Instant,
    last_interruption: Option<InterruptionEvent>,
    /// Set between a barge-in and the transcript of the interrupting turn.
    awaiting_interruption_text: bool,
    history: Vec<HistoryEntry>,
    progress: Arc<PlaybackProgress>,
    config: EngineConfig,
    speech: Arc<dyn SpeechBackend>,
    reasoning: Option<Arc<dyn ReasoningBackend>>,
    orchestrator: Arc<ResponseOrchestrator>,
    out_tx: mpsc::UnboundedSender<WireMessage>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl Session {
    /// Create a session bound to an outbound transport channel. The returned
    /// receiver carries per-turn completions; feed them to `handle_event`.
    pub fn new(
        user_id: Option<String>,
        config: EngineConfig,
        speech: Arc<dyn SpeechBackend>,
        reasoning: Option<Arc<dyn ReasoningBackend>>,
        orchestrator: Arc<ResponseOrchestrator>,
        out_tx: mpsc::UnboundedSender<WireMessage>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            id: Uuid::new_v4(),
            user_id,
            state: SessionState::Idle,
            audio_in: AudioInBuffer::default(),
            pending: None,
            last_activity: Instant::now(),
            last_interruption: None,
            awaiting_interruption_text: false,
            history: Vec::new(),
            progress: Arc::new(PlaybackProgress::new()),
            config,
            speech,
            reasoning,
            orchestrator,
            out_tx,
            events_tx,
        };
        (session, events_rx)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.elapsed()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.audio_in.byte_len()
    }

    pub fn last_interruption(&self) -> Option<&InterruptionEvent> {
        self.last_interruption.as_ref()
    }

    /// Greet a freshly connected client.
    pub fn send_ready(&self) {
        let _ = self.out_tx.send(ServerMessage::Ready {}.to_wire());
    }

    /// Send an `error{message, code}` for a turn-local failure.
    pub fn report_error(&self, err: &VoiceError) {
        let _ = self.out_tx.send(
            ServerMessage::Error {
                message: err.to_string(),
                code: Some(err.code().to_string()),
            }
            .to_wire(),
        );
    }

    /// Handle one inbound transport frame. Errors are protocol rejections:
    /// the session state is unchanged and the connection stays alive unless
    /// `is_turn_local` says otherwise.
    pub async fn handle_message(&mut self, msg: WireMessage) -> VoiceResult<()> {
        match msg {
            WireMessage::Binary(frame) => {
                let payload = codec::decode_audio_message(&frame)?;
                self.on_audio_chunk(payload)?;
                self.last_activity = Instant::now();
                Ok(())
            }
            WireMessage::Text(text) => {
                let parsed = ClientMessage::parse(&text).map_err(VoiceError::Frame)?;
                self.last_activity = Instant::now();
                self.on_control(parsed).await
            }
        }
    }

    async fn on_control(&mut self, msg: ClientMessage) -> VoiceResult<()> {
        match msg {
            ClientMessage::Ping {} => {
                let _ = self.out_tx.send(ServerMessage::Pong {}.to_wire());
                Ok(())
            }
            ClientMessage::AudioStart {
                sample_rate,
                channels,
            } => match transition(self.state, TurnInput::AudioStart)? {
                Transition::To(next) => {
                    self.audio_in.reset(sample_rate, channels);
                    self.state = next;
                    debug!(session = %self.id, "listening at {sample_rate}Hz/{channels}ch");
                    Ok(())
                }
                Transition::BargeIn => {
                    self.on_barge_in(sample_rate, channels).await;
                    Ok(())
                }
                Transition::Stay => Ok(()),
            },
            ClientMessage::AudioEnd {} => {
                match transition(self.state, TurnInput::AudioEnd)? {
                    Transition::To(next) => {
                        // Flushed exactly here: the buffer is empty for the
                        // whole of Processing.
                        let pcm = self.audio_in.flush();
                        let wav = codec::build_wav(
                            &pcm,
                            self.audio_in.sample_rate,
                            self.audio_in.channels,
                            16,
                        );
                        self.state = next;
                        self.spawn_transcription(wav);
                        Ok(())
                    }
                    _ => unreachable!("audio_end only transitions"),
                }
            }
            ClientMessage::Synthesize { text, voice_params } => {
                match transition(self.state, TurnInput::Synthesize)? {
                    Transition::To(next) => {
                        self.state = next;
                        self.spawn_direct_speech(text, voice_params.unwrap_or_default().clamped());
                        Ok(())
                    }
                    _ => unreachable!("synthesize only transitions"),
                }
            }
        }
    }

    fn on_audio_chunk(&mut self, payload: &[u8]) -> VoiceResult<()> {
        transition(self.state, TurnInput::AudioChunk)?;
        if payload.len() > self.config.max_chunk_bytes {
            // Rejected whole, never truncated; state stays Listening.
            return Err(VoiceError::ChunkTooLarge {
                size: payload.len(),
                max: self.config.max_chunk_bytes,
            });
        }
        self.audio_in.chunks.push(payload.to_vec());
        Ok(())
    }

    /// `audio_start` while Speaking: cancel the in-flight synthesis, build
    /// the interruption event from actual playback progress, and start
    /// listening. This is a normal transition, never an error.
    async fn on_barge_in(&mut self, sample_rate: u32, channels: u16) {
        if let Some(PendingTurn::Speaking(task)) = self.pending.take() {
            task.abort();
            // Await the abort: once this returns the speaking task is gone
            // and no further audio bytes can reach the transport.
            let _ = task.await;
        }

        // Progress is reset when a speaking turn starts, so an empty snapshot
        // means the barge-in landed before any utterance began (reasoning
        // still in flight): there is no spoken response to preserve, and the
        // prior turn's text must not be reported as interrupted.
        let (intended, offset) = self.progress.snapshot();
        if intended.is_empty() {
            info!(session = %self.id, "barge-in before speech began");
        } else {
            let event = InterruptionEvent {
                intended_response_text: intended,
                spoken_up_to_offset: offset,
                user_interruption_text: String::new(),
                timestamp: Utc::now(),
            };
            info!(
                session = %self.id,
                offset = event.spoken_up_to_offset,
                "barge-in: synthesis cancelled"
            );
            self.last_interruption = Some(event);
            self.awaiting_interruption_text = true;
        }

        self.audio_in.reset(sample_rate, channels);
        self.state = SessionState::Listening;
    }

    fn spawn_transcription(&mut self, wav: Vec<u8>) {
        let speech = Arc::clone(&self.speech);
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let result = speech.transcribe(wav, None).await;
            let _ = events.send(SessionEvent::TranscriptionFinished(result));
        });
        self.pending = Some(PendingTurn::Transcribing(task));
    }

    fn spawn_direct_speech(&mut self, text: String, voice: VoiceParams) {
        self.progress.reset();
        let speech = Arc::clone(&self.speech);
        let orchestrator = Arc::clone(&self.orchestrator);
        let out = self.out_tx.clone();
        let progress = Arc::clone(&self.progress);
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let result = orchestrator
                .speak_text(&text, &voice, speech, &out, &progress)
                .await
                .map(|_| TurnRecord::default());
            let _ = events.send(SessionEvent::SpeakingFinished(result));
        });
        self.pending = Some(PendingTurn::Speaking(task));
    }

    fn spawn_response_turn(&mut self, user_text: String) {
        let Some(reasoning) = self.reasoning.clone() else {
            return;
        };
        let request = ReasoningRequest {
            user_text,
            interruption: self.last_interruption.take().map(|ev| (&ev).into()),
            history: self.history.clone(),
        };
        // The state machine already moved Idle→Speaking for this turn.
        self.progress.reset();
        let speech = Arc::clone(&self.speech);
        let orchestrator = Arc::clone(&self.orchestrator);
        let out = self.out_tx.clone();
        let progress = Arc::clone(&self.progress);
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let result = orchestrator
                .run_turn(request, reasoning, speech, out, progress)
                .await;
            let _ = events.send(SessionEvent::SpeakingFinished(result));
        });
        self.pending = Some(PendingTurn::Speaking(task));
    }

    /// Handle a per-turn completion. Stale completions (an aborted speaking
    /// task that raced its final send against the barge-in) are dropped.
    pub async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::TranscriptionFinished(result) => {
                if !matches!(self.pending, Some(PendingTurn::Transcribing(_))) {
                    return;
                }
                self.pending = None;
                match transition(self.state, TurnInput::TranscriptionDone) {
                    Ok(Transition::To(next)) => self.state = next,
                    _ => return,
                }
                match result {
                    Ok(transcript) => self.on_transcript(transcript),
                    Err(err) => {
                        warn!(session = %self.id, "transcription failed: {err}");
                        self.report_error(&err);
                        // Turn is over; session is ready for the next one.
                    }
                }
            }
            SessionEvent::SpeakingFinished(result) => {
                if !matches!(self.pending, Some(PendingTurn::Speaking(_))) {
                    return;
                }
                self.pending = None;
                match transition(self.state, TurnInput::PlaybackDone) {
                    Ok(Transition::To(next)) => self.state = next,
                    _ => return,
                }
                match result {
                    Ok(record) => {
                        for utterance in record.committed {
                            let mut text = utterance.spoken;
                            if utterance.truncated {
                                text.push('—');
                            }
                            self.push_history(HistoryRole::Agent, text);
                        }
                    }
                    Err(err) => {
                        warn!(session = %self.id, "speaking turn failed: {err}");
                        self.report_error(&err);
                    }
                }
            }
        }
    }

    fn on_transcript(&mut self, transcript: Transcript) {
        if self.awaiting_interruption_text {
            if let Some(event) = self.last_interruption.as_mut() {
                event.user_interruption_text = transcript.text.clone();
            }
            self.awaiting_interruption_text = false;
        }

        let _ = self.out_tx.send(
            ServerMessage::Transcription {
                text: transcript.text.clone(),
                language: transcript.language.clone(),
                is_final: transcript.is_final,
            }
            .to_wire(),
        );

        // Only final transcripts reach the reasoning layer.
        if !transcript.is_final || transcript.text.trim().is_empty() {
            return;
        }
        self.push_history(HistoryRole::User, transcript.text.clone());

        if self.reasoning.is_some() {
            if let Ok(Transition::To(next)) = transition(self.state, TurnInput::Synthesize) {
                self.state = next;
                self.spawn_response_turn(transcript.text);
            }
        }
    }

    fn push_history(&mut self, role: HistoryRole, text: String) {
        self.history.push(HistoryEntry { role, text });
        if self.history.len() > MAX_HISTORY_ENTRIES {
            let excess = self.history.len() - MAX_HISTORY_ENTRIES;
            self.history.drain(..excess);
        }
    }

    /// Tear the session down: cancel any in-flight turn and drop buffers.
    /// Safe to call more than once; disconnect and idle timeout both land
    /// here.
    pub async fn close(&mut self) {
        if let Some(pending) = self.pending.take() {
            let task = match pending {
                PendingTurn::Transcribing(t) | PendingTurn::Speaking(t) => t,
            };
            task.abort();
            let _ = task.await;
        }
        self.audio_in.chunks.clear();
        self.state = SessionState::Idle;
        debug!(session = %self.id, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::PlaceholderBackend;
    use crate::orchestrator::{OrchestratorConfig, PlaceholderReasoning};
    use std::time::Duration;

    fn wire_chunk(payload: &[u8]) -> WireMessage {
        WireMessage::Binary(codec::encode_frame(codec::FRAME_KIND_CLIENT_AUDIO, payload))
    }

    fn text(msg: &str) -> WireMessage {
        WireMessage::Text(msg.to_string())
    }

    struct Harness {
        session: Session,
        events_rx: mpsc::UnboundedReceiver<SessionEvent>,
        out_rx: mpsc::UnboundedReceiver<WireMessage>,
    }

    fn harness(speech: PlaceholderBackend, reasoning: Option<PlaceholderReasoning>) -> Harness {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(ResponseOrchestrator::new(OrchestratorConfig {
            fast_ack_threshold: Duration::from_secs(5),
            ..OrchestratorConfig::default()
        }));
        let (session, events_rx) = Session::new(
            None,
            EngineConfig::default(),
            Arc::new(speech),
            reasoning.map(|r| Arc::new(r) as Arc<dyn ReasoningBackend>),
            orchestrator,
            out_tx,
        );
        Harness {
            session,
            events_rx,
            out_rx,
        }
    }

    /// Drive buffered completions through the session, as the manager's
    /// driver loop would.
    async fn pump(h: &mut Harness) {
        // Give spawned turn tasks a chance to finish.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            match h.events_rx.try_recv() {
                Ok(ev) => h.session.handle_event(ev).await,
                Err(_) => {
                    if h.session.pending.is_none() {
                        break;
                    }
                }
            }
        }
    }

    fn drain(h: &mut Harness) -> Vec<WireMessage> {
        let mut out = Vec::new();
        while let Ok(m) = h.out_rx.try_recv() {
            out.push(m);
        }
        out
    }

    fn texts(messages: &[WireMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|m| match m {
                WireMessage::Text(t) => Some(t.clone()),
                WireMessage::Binary(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn listening_turn_produces_final_transcription() {
        let mut h = harness(PlaceholderBackend::with_transcript("hello engine"), None);
        h.session
            .handle_message(text(r#"{"type":"audio_start","sample_rate":16000,"channels":1}"#))
            .await
            .unwrap();
        for _ in 0..3 {
            h.session
                .handle_message(wire_chunk(&vec![0u8; 4096]))
                .await
                .unwrap();
        }
        assert_eq!(h.session.buffered_bytes(), 3 * 4096);
        h.session
            .handle_message(text(r#"{"type":"audio_end"}"#))
            .await
            .unwrap();
        // Buffer flushed exactly at the Listening→Processing transition.
        assert_eq!(h.session.buffered_bytes(), 0);
        assert_eq!(h.session.state(), SessionState::Processing);

        pump(&mut h).await;
        assert_eq!(h.session.state(), SessionState::Idle);

        let out = texts(&drain(&mut h));
        let transcription = out.iter().find(|t| t.contains("transcription")).unwrap();
        assert!(transcription.contains("hello engine"));
        assert!(transcription.contains(r#""is_final":true"#));
    }

    #[tokio::test]
    async fn chunk_before_audio_start_is_protocol_error() {
        let mut h = harness(PlaceholderBackend::default(), None);
        let err = h
            .session
            .handle_message(wire_chunk(&[0u8; 16]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "protocol_state");
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.session.buffered_bytes(), 0);
    }

    #[tokio::test]
    async fn oversized_chunk_is_rejected_and_not_buffered() {
        let mut h = harness(PlaceholderBackend::default(), None);
        h.session
            .handle_message(text(r#"{"type":"audio_start","sample_rate":16000,"channels":1}"#))
            .await
            .unwrap();
        let max = h.session.config.max_chunk_bytes;
        let err = h
            .session
            .handle_message(wire_chunk(&vec![0u8; max + 1]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "chunk_too_large");
        assert_eq!(h.session.state(), SessionState::Listening);
        assert_eq!(h.session.buffered_bytes(), 0);

        // The session recovers with a valid chunk.
        h.session
            .handle_message(wire_chunk(&vec![0u8; 1024]))
            .await
            .unwrap();
        assert_eq!(h.session.buffered_bytes(), 1024);
    }

    #[tokio::test]
    async fn barge_in_records_one_interruption_and_listens() {
        let speech = PlaceholderBackend {
            chunk_count: 200,
            chunk_bytes: 4096,
            chunk_delay: Duration::from_millis(10),
            ..PlaceholderBackend::default()
        };
        let mut h = harness(speech, None);

        h.session
            .handle_message(text(
                r#"{"type":"synthesize","text":"a long answer the user will cut off"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(h.session.state(), SessionState::Speaking);

        // Let some audio stream, then barge in.
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.session
            .handle_message(text(r#"{"type":"audio_start","sample_rate":16000,"channels":1}"#))
            .await
            .unwrap();

        assert_eq!(h.session.state(), SessionState::Listening);
        assert_eq!(h.session.buffered_bytes(), 0);
        let event = h.session.last_interruption().unwrap();
        assert_eq!(
            event.intended_response_text,
            "a long answer the user will cut off"
        );
        assert!(
            event.spoken_up_to_offset <= event.intended_response_text.chars().count()
        );

        // Cancellation is not an error, and no further synthesis audio is
        // emitted once the barge-in has been handled.
        let before = drain(&mut h);
        assert!(!texts(&before).iter().any(|t| t.contains("error")));
        tokio::time::sleep(Duration::from_millis(60)).await;
        let after = drain(&mut h);
        assert!(
            after
                .iter()
                .all(|m| !matches!(m, WireMessage::Binary(_))),
            "synthesis audio leaked after barge-in"
        );
    }

    #[tokio::test]
    async fn barge_in_during_reasoning_wait_records_no_stale_event() {
        // Reasoning stalls, so the response turn sits in Speaking with no
        // utterance begun when the barge-in lands.
        let reasoning = PlaceholderReasoning {
            response: Some("too late".to_string()),
            delay: Duration::from_secs(30),
        };
        let mut h = harness(
            PlaceholderBackend::with_transcript("next question"),
            Some(reasoning),
        );

        // A prior, fully played utterance leaves text behind in the
        // playback tracker.
        h.session
            .handle_message(text(r#"{"type":"synthesize","text":"first answer"}"#))
            .await
            .unwrap();
        pump(&mut h).await;
        assert_eq!(h.session.state(), SessionState::Idle);

        // A listening turn whose transcript starts a response turn.
        h.session
            .handle_message(text(r#"{"type":"audio_start","sample_rate":16000,"channels":1}"#))
            .await
            .unwrap();
        h.session
            .handle_message(wire_chunk(&vec![0u8; 1024]))
            .await
            .unwrap();
        h.session
            .handle_message(text(r#"{"type":"audio_end"}"#))
            .await
            .unwrap();
        pump(&mut h).await;
        assert_eq!(h.session.state(), SessionState::Speaking);

        // Barge in while reasoning is still in flight: nothing has been
        // spoken this turn, so no interruption event may be recorded — in
        // particular not one naming the previous turn's utterance.
        h.session
            .handle_message(text(r#"{"type":"audio_start","sample_rate":16000,"channels":1}"#))
            .await
            .unwrap();
        assert_eq!(h.session.state(), SessionState::Listening);
        assert!(h.session.last_interruption().is_none());
    }

    #[tokio::test]
    async fn interruption_context_flows_into_next_reasoning_request() {
        use crate::orchestrator::ReasoningRequest;
        use async_trait::async_trait;
        use std::sync::Mutex;

        struct Capture(Mutex<Vec<ReasoningRequest>>);

        #[async_trait]
        impl ReasoningBackend for Capture {
            async fn respond(&self, request: ReasoningRequest) -> VoiceResult<String> {
                self.0.lock().unwrap().push(request);
                Ok("noted".to_string())
            }
        }

        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(ResponseOrchestrator::new(OrchestratorConfig {
            fast_ack_threshold: Duration::from_secs(5),
            ..OrchestratorConfig::default()
        }));
        let speech = PlaceholderBackend {
            chunk_count: 200,
            chunk_bytes: 4096,
            chunk_delay: Duration::from_millis(10),
            transcript: Some("actually, stop".to_string()),
            ..PlaceholderBackend::default()
        };
        let (mut session, mut events_rx) = Session::new(
            None,
            EngineConfig::default(),
            Arc::new(speech),
            Some(capture.clone() as Arc<dyn ReasoningBackend>),
            orchestrator,
            out_tx,
        );

        // Agent starts speaking, user barges in and completes a turn.
        session
            .handle_message(text(r#"{"type":"synthesize","text":"let me explain everything"}"#))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        session
            .handle_message(text(r#"{"type":"audio_start","sample_rate":16000,"channels":1}"#))
            .await
            .unwrap();
        session
            .handle_message(wire_chunk(&vec![0u8; 2048]))
            .await
            .unwrap();
        session
            .handle_message(text(r#"{"type":"audio_end"}"#))
            .await
            .unwrap();

        // Drive the transcription completion and the follow-on response turn.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if let Ok(ev) = events_rx.try_recv() {
                session.handle_event(ev).await;
            }
            if !capture.0.lock().unwrap().is_empty() {
                break;
            }
        }

        let requests = capture.0.lock().unwrap();
        let request = requests.first().expect("reasoning request issued");
        assert_eq!(request.user_text, "actually, stop");
        let ctx = request.interruption.as_ref().expect("interruption context");
        assert_eq!(ctx.intended_response_text, "let me explain everything");
        assert_eq!(ctx.user_interruption_text, "actually, stop");
        assert!(ctx.spoken_up_to_offset <= ctx.intended_response_text.chars().count());
        drop(requests);

        while out_rx.try_recv().is_ok() {}
    }

    #[tokio::test]
    async fn synthesize_streams_and_returns_to_idle() {
        let mut h = harness(
            PlaceholderBackend {
                chunk_count: 3,
                chunk_bytes: 8192,
                ..PlaceholderBackend::default()
            },
            None,
        );
        h.session
            .handle_message(text(r#"{"type":"synthesize","text":"hello there"}"#))
            .await
            .unwrap();
        pump(&mut h).await;
        assert_eq!(h.session.state(), SessionState::Idle);

        let out = drain(&mut h);
        let binary: Vec<_> = out
            .iter()
            .filter(|m| matches!(m, WireMessage::Binary(_)))
            .collect();
        assert_eq!(binary.len(), 3);
        let t = texts(&out);
        assert!(t.iter().any(|m| m.contains("audio_start")));
        assert!(t.iter().any(|m| m.contains("audio_end")));
        assert!(t.iter().any(|m| m.contains("duration_seconds")));
    }

    #[tokio::test]
    async fn synthesize_while_listening_is_rejected_without_transition() {
        let mut h = harness(PlaceholderBackend::default(), None);
        h.session
            .handle_message(text(r#"{"type":"audio_start","sample_rate":16000,"channels":1}"#))
            .await
            .unwrap();
        let err = h
            .session
            .handle_message(text(r#"{"type":"synthesize","text":"nope"}"#))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "protocol_state");
        assert_eq!(h.session.state(), SessionState::Listening);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut h = harness(
            PlaceholderBackend {
                chunk_count: 100,
                chunk_delay: Duration::from_millis(10),
                ..PlaceholderBackend::default()
            },
            None,
        );
        h.session
            .handle_message(text(r#"{"type":"synthesize","text":"long"}"#))
            .await
            .unwrap();
        h.session.close().await;
        h.session.close().await;
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn ping_works_in_any_state() {
        let mut h = harness(PlaceholderBackend::default(), None);
        h.session
            .handle_message(text(r#"{"type":"audio_start","sample_rate":16000,"channels":1}"#))
            .await
            .unwrap();
        h.session
            .handle_message(text(r#"{"type":"ping"}"#))
            .await
            .unwrap();
        let out = texts(&drain(&mut h));
        assert!(out.iter().any(|t| t.contains("pong")));
        assert_eq!(h.session.state(), SessionState::Listening);
    }
}
