//! Response orchestrator
//!
//! Decides, per turn, whether to cover reasoning latency with a fast
//! acknowledgment, and resolves the race when the deep response becomes
//! ready while the fast-ack is still streaming: the fast-ack is superseded —
//! cancelled exactly once, with the prefix actually spoken committed to the
//! turn record so the agent can resume naturally instead of stuttering.

use crate::bridge::SpeechBackend;
use crate::codec;
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{ServerMessage, VoiceParams, WireMessage};
use crate::turn::{InterruptionEvent, PlaybackProgress};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Which tier a spoken utterance belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    FastAck,
    DeepResponse,
}

/// An utterance the agent actually spoke (possibly truncated by
/// supersession). Committed utterances belong in conversation history.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedUtterance {
    pub tier: TierKind,
    /// Full text the tier carried.
    pub text: String,
    /// The prefix estimated to have reached the client.
    pub spoken: String,
    pub truncated: bool,
}

/// Result of one orchestrated response turn.
#[derive(Debug, Clone, Default)]
pub struct TurnRecord {
    pub committed: Vec<CommittedUtterance>,
    /// True when the fast-ack was cancelled in favor of the deep response.
    pub superseded: bool,
}

/// Structured barge-in context for the reasoning layer. Carries the full
/// intended text plus where it was cut off — never a lossy truncated string.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InterruptionContext {
    pub intended_response_text: String,
    pub spoken_up_to_offset: usize,
    /// Convenience: the prefix the user actually heard.
    pub heard_prefix: String,
    pub user_interruption_text: String,
}

impl From<&InterruptionEvent> for InterruptionContext {
    fn from(ev: &InterruptionEvent) -> Self {
        Self {
            intended_response_text: ev.intended_response_text.clone(),
            spoken_up_to_offset: ev.spoken_up_to_offset,
            heard_prefix: ev.spoken_prefix().to_string(),
            user_interruption_text: ev.user_interruption_text.clone(),
        }
    }
}

/// One prior exchange, oldest first.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    User,
    Agent,
}

/// Request to the external reasoning layer.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReasoningRequest {
    pub user_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interruption: Option<InterruptionContext>,
    pub history: Vec<HistoryEntry>,
}

/// The external reasoning step that produces response text. Retry policy, if
/// any, lives behind this seam — never in the speech bridge.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn respond(&self, request: ReasoningRequest) -> VoiceResult<String>;
}

/// Placeholder reasoning: acknowledges the prompt. Use for testing the
/// session loop without an LLM.
#[derive(Debug, Default)]
pub struct PlaceholderReasoning {
    /// If set, always respond with this text.
    pub response: Option<String>,
    /// Optional artificial latency, to exercise the fast-ack path.
    pub delay: Duration,
}

impl PlaceholderReasoning {
    pub fn with_response(text: impl Into<String>) -> Self {
        Self {
            response: Some(text.into()),
            delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl ReasoningBackend for PlaceholderReasoning {
    async fn respond(&self, request: ReasoningRequest) -> VoiceResult<String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self
            .response
            .clone()
            .unwrap_or_else(|| format!("You said: {}", request.user_text)))
    }
}

/// Reasoning over HTTP: posts the structured request to a chat endpoint and
/// reads `{response}` back.
#[derive(Debug, Clone)]
pub struct HttpReasoningBackend {
    pub url: String,
    client: reqwest::Client,
}

impl HttpReasoningBackend {
    pub fn new(url: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Reasoning(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl ReasoningBackend for HttpReasoningBackend {
    async fn respond(&self, request: ReasoningRequest) -> VoiceResult<String> {
        let res = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| VoiceError::Reasoning(e.to_string()))?;
        if !res.status().is_success() {
            return Err(VoiceError::Reasoning(format!(
                "reasoning endpoint returned {}",
                res.status()
            )));
        }
        let json: serde_json::Value = res
            .json()
            .await
            .map_err(|e| VoiceError::Reasoning(e.to_string()))?;
        json.get("response")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| VoiceError::Reasoning("missing `response` field".to_string()))
    }
}

/// Configuration for the response orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Wait this long for the deep response before speaking a fast-ack.
    pub fast_ack_threshold: Duration,
    /// Rotation of short acknowledgment utterances.
    pub fast_ack_phrases: Vec<String>,
    /// Voice parameters applied to orchestrated synthesis.
    pub voice: VoiceParams,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let engine = crate::config::EngineConfig::default();
        Self {
            fast_ack_threshold: engine.fast_ack_threshold,
            fast_ack_phrases: engine.fast_ack_phrases,
            voice: VoiceParams::default(),
        }
    }
}

/// Abort-on-drop wrapper for the in-flight reasoning call, so an error in a
/// synthesis path can't leak a running task.
struct DeepHandle(JoinHandle<VoiceResult<String>>);

impl DeepHandle {
    async fn join(mut self) -> VoiceResult<String> {
        // Drop's abort is a no-op once the task has completed.
        join_deep(&mut self.0).await
    }
}

impl Drop for DeepHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn join_deep(task: &mut JoinHandle<VoiceResult<String>>) -> VoiceResult<String> {
    match task.await {
        Ok(result) => result,
        Err(e) => Err(VoiceError::Reasoning(format!("reasoning task failed: {e}"))),
    }
}

enum UtteranceEnd {
    Completed { duration_seconds: f64 },
    Superseded { deep: VoiceResult<String> },
}

/// Coordinates reasoning latency, fast acknowledgments, and supersession for
/// a single session's response turns.
pub struct ResponseOrchestrator {
    config: OrchestratorConfig,
    ack_cursor: AtomicUsize,
}

impl ResponseOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            ack_cursor: AtomicUsize::new(0),
        }
    }

    fn next_ack_phrase(&self) -> Option<String> {
        if self.config.fast_ack_phrases.is_empty() {
            return None;
        }
        let i = self.ack_cursor.fetch_add(1, Ordering::Relaxed);
        Some(self.config.fast_ack_phrases[i % self.config.fast_ack_phrases.len()].clone())
    }

    /// Run one full response turn: reasoning plus tiered delivery.
    ///
    /// Streams audio onto `out` and tracks delivery in `progress` so the
    /// session can compute an interruption offset if this task is aborted by
    /// a barge-in.
    pub async fn run_turn(
        &self,
        request: ReasoningRequest,
        reasoning: Arc<dyn ReasoningBackend>,
        speech: Arc<dyn SpeechBackend>,
        out: mpsc::UnboundedSender<WireMessage>,
        progress: Arc<PlaybackProgress>,
    ) -> VoiceResult<TurnRecord> {
        let mut deep = DeepHandle(tokio::spawn(async move { reasoning.respond(request).await }));
        let mut record = TurnRecord::default();

        // Latency probe: if the deep response lands inside the threshold
        // there is nothing to cover and no fast-ack is spoken.
        let early =
            match tokio::time::timeout(self.config.fast_ack_threshold, &mut deep.0).await {
                Ok(joined) => Some(joined.map_err(|e| {
                    VoiceError::Reasoning(format!("reasoning task failed: {e}"))
                })?),
                Err(_) => None,
            };

        let deep_text = match early {
            Some(result) => result?,
            None => {
                let Some(ack_text) = self.next_ack_phrase() else {
                    // No phrases configured: just wait for the deep response.
                    return self
                        .finish_with_deep(deep.join().await?, &speech, &out, &progress, record)
                        .await;
                };

                info!("deep response past threshold, speaking fast-ack");
                match self
                    .stream_utterance(
                        &ack_text,
                        &self.config.voice,
                        &speech,
                        &out,
                        &progress,
                        Some(&mut deep),
                    )
                    .await?
                {
                    UtteranceEnd::Completed { .. } => {
                        record.committed.push(CommittedUtterance {
                            tier: TierKind::FastAck,
                            text: ack_text.clone(),
                            spoken: ack_text,
                            truncated: false,
                        });
                        // Fast-ack fully played: the deep response simply
                        // follows it, no supersession.
                        deep.join().await?
                    }
                    UtteranceEnd::Superseded { deep: deep_result } => {
                        let (_, offset) = progress.snapshot();
                        let spoken = InterruptionEvent {
                            intended_response_text: ack_text.clone(),
                            spoken_up_to_offset: offset,
                            user_interruption_text: String::new(),
                            timestamp: chrono::Utc::now(),
                        }
                        .spoken_prefix()
                        .to_string();
                        record.committed.push(CommittedUtterance {
                            tier: TierKind::FastAck,
                            text: ack_text,
                            spoken,
                            truncated: true,
                        });
                        record.superseded = true;
                        deep_result?
                    }
                }
            }
        };

        self.finish_with_deep(deep_text, &speech, &out, &progress, record)
            .await
    }

    /// Speak one utterance directly, outside the tiered reasoning flow. Used
    /// for client-driven `synthesize` requests. Returns the streamed
    /// duration in seconds.
    pub async fn speak_text(
        &self,
        text: &str,
        voice: &VoiceParams,
        speech: Arc<dyn SpeechBackend>,
        out: &mpsc::UnboundedSender<WireMessage>,
        progress: &Arc<PlaybackProgress>,
    ) -> VoiceResult<f64> {
        match self
            .stream_utterance(text, voice, &speech, out, progress, None)
            .await?
        {
            UtteranceEnd::Completed { duration_seconds } => Ok(duration_seconds),
            UtteranceEnd::Superseded { .. } => unreachable!("no race on direct synthesis"),
        }
    }

    async fn finish_with_deep(
        &self,
        deep_text: String,
        speech: &Arc<dyn SpeechBackend>,
        out: &mpsc::UnboundedSender<WireMessage>,
        progress: &Arc<PlaybackProgress>,
        mut record: TurnRecord,
    ) -> VoiceResult<TurnRecord> {
        if deep_text.trim().is_empty() {
            debug!("empty deep response, nothing to speak");
            return Ok(record);
        }
        match self
            .stream_utterance(&deep_text, &self.config.voice, speech, out, progress, None)
            .await?
        {
            UtteranceEnd::Completed { .. } => {
                record.committed.push(CommittedUtterance {
                    tier: TierKind::DeepResponse,
                    text: deep_text.clone(),
                    spoken: deep_text,
                    truncated: false,
                });
                Ok(record)
            }
            UtteranceEnd::Superseded { .. } => unreachable!("no race while streaming deep tier"),
        }
    }

    /// Synthesize `text` and stream it to the client in playback-sized
    /// pieces. While a fast-ack streams, `race` watches the deep response;
    /// if it becomes ready mid-stream the synthesis is cancelled (no further
    /// bytes after the cancel acknowledges) and `Superseded` is returned.
    async fn stream_utterance(
        &self,
        text: &str,
        voice: &VoiceParams,
        speech: &Arc<dyn SpeechBackend>,
        out: &mpsc::UnboundedSender<WireMessage>,
        progress: &Arc<PlaybackProgress>,
        mut race: Option<&mut DeepHandle>,
    ) -> VoiceResult<UtteranceEnd> {
        let mut stream = speech.synthesize(text, voice).await?;
        progress.begin_utterance(text, stream.sample_rate);
        send(
            out,
            ServerMessage::AudioStart {
                sample_rate: stream.sample_rate,
            }
            .to_wire(),
        )?;

        loop {
            let next = if let Some(deep) = race.as_deref_mut() {
                tokio::select! {
                    chunk = stream.next_chunk() => ChunkOrDeep::Chunk(chunk),
                    joined = &mut deep.0 => ChunkOrDeep::Deep(match joined {
                        Ok(result) => result,
                        Err(e) => Err(VoiceError::Reasoning(format!("reasoning task failed: {e}"))),
                    }),
                }
            } else {
                ChunkOrDeep::Chunk(stream.next_chunk().await)
            };

            match next {
                ChunkOrDeep::Chunk(Some(Ok(bytes))) => {
                    let len = bytes.len();
                    send(out, WireMessage::Binary(codec::encode_audio_message(&bytes)))?;
                    progress.add_bytes_sent(len);
                }
                ChunkOrDeep::Chunk(Some(Err(e))) => {
                    warn!("synthesis stream failed mid-utterance: {e}");
                    return Err(e);
                }
                ChunkOrDeep::Chunk(None) => {
                    progress.mark_complete();
                    let duration_seconds = progress.seconds_sent();
                    send(out, ServerMessage::AudioEnd { duration_seconds }.to_wire())?;
                    return Ok(UtteranceEnd::Completed { duration_seconds });
                }
                ChunkOrDeep::Deep(deep_result) => {
                    info!("deep response ready mid-fast-ack, superseding");
                    stream.cancel().await;
                    let duration_seconds = progress.seconds_sent();
                    send(out, ServerMessage::AudioEnd { duration_seconds }.to_wire())?;
                    return Ok(UtteranceEnd::Superseded { deep: deep_result });
                }
            }
        }
    }
}

enum ChunkOrDeep {
    Chunk(Option<VoiceResult<Vec<u8>>>),
    Deep(VoiceResult<String>),
}

fn send(out: &mpsc::UnboundedSender<WireMessage>, msg: WireMessage) -> VoiceResult<()> {
    out.send(msg)
        .map_err(|_| VoiceError::ChannelSend("outbound channel closed".to_string()))
}
