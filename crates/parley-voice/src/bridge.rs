//! **Backend Bridge** — client-side abstraction over the external STT/TTS
//! service.
//!
//! Exposes `transcribe` and `synthesize` (plus a health probe) behind the
//! [`SpeechBackend`] trait. Both calls are async; synthesis returns a
//! cancellable byte stream. The bridge never retries internally — retry
//! policy belongs to the orchestrator.

use crate::error::{VoiceError, VoiceResult};
use crate::protocol::VoiceParams;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default PCM sample rate of the backend's streamed synthesis output.
pub const TTS_STREAM_SAMPLE_RATE: u32 = 24_000;

/// Output of speech-to-text.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub language: String,
    pub language_confidence: f32,
    pub duration_seconds: f64,
    /// Only final transcripts are forwarded to the reasoning layer.
    pub is_final: bool,
}

/// Backend health, mirrored from the service's `/health` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendHealth {
    pub status: String,
    pub stt_loaded: bool,
    pub tts_loaded: bool,
    pub device: String,
}

/// A cancellable stream of synthesized audio chunks.
///
/// Chunks are already re-framed to the engine's playback size. `cancel`
/// aborts the producer task and awaits the abort, so once it returns no
/// further bytes can be delivered — the acknowledgment the state machine
/// needs before transitioning to Listening.
pub struct SynthesisStream {
    rx: mpsc::Receiver<VoiceResult<Vec<u8>>>,
    task: JoinHandle<()>,
    /// PCM sample rate of the streamed audio.
    pub sample_rate: u32,
}

impl SynthesisStream {
    pub fn new(
        rx: mpsc::Receiver<VoiceResult<Vec<u8>>>,
        task: JoinHandle<()>,
        sample_rate: u32,
    ) -> Self {
        Self {
            rx,
            task,
            sample_rate,
        }
    }

    /// Receive the next audio chunk; `None` when synthesis is complete.
    pub async fn next_chunk(&mut self) -> Option<VoiceResult<Vec<u8>>> {
        self.rx.recv().await
    }

    /// Cooperatively cancel the in-flight synthesis. Consumes the stream:
    /// after this returns the producer task has stopped.
    pub async fn cancel(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        self.rx.close();
        debug!("synthesis stream cancelled");
    }
}

impl Drop for SynthesisStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The two operations the engine needs from the speech service, plus health.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Transcribe a complete WAV container. Fails with
    /// [`VoiceError::Transcription`].
    async fn transcribe(
        &self,
        wav: Vec<u8>,
        language_hint: Option<&str>,
    ) -> VoiceResult<Transcript>;

    /// Synthesize text into a cancellable audio stream. Fails with
    /// [`VoiceError::Synthesis`].
    async fn synthesize(&self, text: &str, params: &VoiceParams) -> VoiceResult<SynthesisStream>;

    /// Probe backend health.
    async fn health(&self) -> VoiceResult<BackendHealth>;
}

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    text: String,
    language: String,
    language_probability: f32,
    duration_seconds: f64,
}

/// Production bridge: the voice backend's HTTP contract.
///
/// `POST /transcribe` (multipart WAV) → `{text, language,
/// language_probability, duration_seconds}`; `POST /synthesize/stream` →
/// raw PCM bytes, streamed; `GET /health`.
#[derive(Debug, Clone)]
pub struct HttpSpeechBackend {
    /// Base URL without trailing slash (e.g. http://127.0.0.1:8001).
    pub base_url: String,
    playback_chunk_bytes: usize,
    client: reqwest::Client,
}

impl HttpSpeechBackend {
    pub fn new(base_url: impl Into<String>, playback_chunk_bytes: usize) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Backend(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            playback_chunk_bytes,
            client,
        })
    }
}

#[async_trait]
impl SpeechBackend for HttpSpeechBackend {
    async fn transcribe(
        &self,
        wav: Vec<u8>,
        language_hint: Option<&str>,
    ) -> VoiceResult<Transcript> {
        let url = format!("{}/transcribe", self.base_url);
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new().part("audio", part);
        if let Some(lang) = language_hint {
            form = form.text("language", lang.to_string());
        }

        let res = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Transcription(format!(
                "backend returned {status}: {body}"
            )));
        }
        let body: TranscribeResponse = res
            .json()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;

        Ok(Transcript {
            text: body.text.trim().to_string(),
            language: body.language,
            language_confidence: body.language_probability,
            duration_seconds: body.duration_seconds,
            is_final: true,
        })
    }

    async fn synthesize(&self, text: &str, params: &VoiceParams) -> VoiceResult<SynthesisStream> {
        let url = format!("{}/synthesize/stream", self.base_url);
        let params = params.clone().clamped();
        let body = serde_json::json!({
            "text": text,
            "exaggeration": params.exaggeration,
            "cfg_weight": params.cfg_weight,
        });

        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Synthesis(format!(
                "backend returned {status}: {body}"
            )));
        }

        let sample_rate = res
            .headers()
            .get("x-sample-rate")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(TTS_STREAM_SAMPLE_RATE);

        let (tx, rx) = mpsc::channel(16);
        let chunk_bytes = self.playback_chunk_bytes;
        let task = tokio::spawn(async move {
            let mut stream = res.bytes_stream();
            // Re-frame into fixed playback pieces regardless of how the
            // backend chunks its response body.
            let mut pending: Vec<u8> = Vec::with_capacity(chunk_bytes);
            while let Some(next) = stream.next().await {
                match next {
                    Ok(bytes) => {
                        pending.extend_from_slice(&bytes);
                        while pending.len() >= chunk_bytes {
                            let rest = pending.split_off(chunk_bytes);
                            let piece = std::mem::replace(&mut pending, rest);
                            if tx.send(Ok(piece)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(VoiceError::Synthesis(e.to_string()))).await;
                        return;
                    }
                }
            }
            if !pending.is_empty() {
                let _ = tx.send(Ok(pending)).await;
            }
        });

        Ok(SynthesisStream::new(rx, task, sample_rate))
    }

    async fn health(&self) -> VoiceResult<BackendHealth> {
        let url = format!("{}/health", self.base_url);
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| VoiceError::Backend(e.to_string()))?;
        res.json()
            .await
            .map_err(|e| VoiceError::Backend(e.to_string()))
    }
}

/// Placeholder backend: deterministic transcripts and synthetic audio.
/// Use for testing the session engine without a running speech service.
#[derive(Debug, Clone)]
pub struct PlaceholderBackend {
    /// If set, every transcription returns this text.
    pub transcript: Option<String>,
    /// Number of audio chunks each synthesis produces.
    pub chunk_count: usize,
    /// Size of each synthetic chunk.
    pub chunk_bytes: usize,
    /// Pause between chunks, to let tests pace playback.
    pub chunk_delay: Duration,
    pub sample_rate: u32,
}

impl Default for PlaceholderBackend {
    fn default() -> Self {
        Self {
            transcript: None,
            chunk_count: 4,
            chunk_bytes: 8 * 1024,
            chunk_delay: Duration::ZERO,
            sample_rate: TTS_STREAM_SAMPLE_RATE,
        }
    }
}

impl PlaceholderBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transcript(text: impl Into<String>) -> Self {
        Self {
            transcript: Some(text.into()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl SpeechBackend for PlaceholderBackend {
    async fn transcribe(
        &self,
        wav: Vec<u8>,
        _language_hint: Option<&str>,
    ) -> VoiceResult<Transcript> {
        let text = self
            .transcript
            .clone()
            .unwrap_or_else(|| format!("[placeholder transcript of {} bytes]", wav.len()));
        Ok(Transcript {
            text,
            language: "en".to_string(),
            language_confidence: 1.0,
            duration_seconds: wav.len().saturating_sub(44) as f64 / 32_000.0,
            is_final: true,
        })
    }

    async fn synthesize(&self, _text: &str, _params: &VoiceParams) -> VoiceResult<SynthesisStream> {
        let (tx, rx) = mpsc::channel(16);
        let count = self.chunk_count;
        let size = self.chunk_bytes;
        let delay = self.chunk_delay;
        let task = tokio::spawn(async move {
            for _ in 0..count {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(vec![0u8; size])).await.is_err() {
                    return;
                }
            }
        });
        Ok(SynthesisStream::new(rx, task, self.sample_rate))
    }

    async fn health(&self) -> VoiceResult<BackendHealth> {
        Ok(BackendHealth {
            status: "ok".to_string(),
            stt_loaded: true,
            tts_loaded: true,
            device: "placeholder".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn placeholder_transcribes() {
        let backend = PlaceholderBackend::with_transcript("hello there");
        let t = backend.transcribe(vec![0u8; 44 + 320], None).await.unwrap();
        assert_eq!(t.text, "hello there");
        assert!(t.is_final);
        assert!(t.duration_seconds > 0.0);
    }

    #[tokio::test]
    async fn placeholder_streams_all_chunks() {
        let backend = PlaceholderBackend {
            chunk_count: 3,
            chunk_bytes: 128,
            ..PlaceholderBackend::default()
        };
        let mut stream = backend
            .synthesize("hi", &VoiceParams::default())
            .await
            .unwrap();
        let mut total = 0;
        while let Some(chunk) = stream.next_chunk().await {
            total += chunk.unwrap().len();
        }
        assert_eq!(total, 3 * 128);
    }

    #[tokio::test]
    async fn cancel_stops_delivery() {
        let backend = PlaceholderBackend {
            chunk_count: 100,
            chunk_bytes: 64,
            chunk_delay: Duration::from_millis(10),
            ..PlaceholderBackend::default()
        };
        let mut stream = backend
            .synthesize("long speech", &VoiceParams::default())
            .await
            .unwrap();
        let first = stream.next_chunk().await;
        assert!(first.is_some());
        stream.cancel().await;
        // Consumed by cancel; nothing further can be observed by construction.
    }
}
