//! Axum-based voice gateway: exposes the session engine over a websocket,
//! bridging browser clients to the speech backend and reasoning endpoint.

mod ws;

use anyhow::Context;
use axum::{
    extract::State,
    response::Json,
    routing::get,
    Router,
};
use parley_voice::{
    EngineConfig, HttpReasoningBackend, HttpSpeechBackend, ReasoningBackend, SessionManager,
    SpeechBackend,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub speech: Arc<dyn SpeechBackend>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("parley_gateway=info,parley_voice=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env()?;
    let addr = std::env::var("VOICE_GATEWAY_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());

    let speech: Arc<dyn SpeechBackend> = Arc::new(HttpSpeechBackend::new(
        config.backend_url.clone(),
        config.playback_chunk_bytes,
    )?);

    let reasoning: Option<Arc<dyn ReasoningBackend>> = match std::env::var("VOICE_REASONING_URL") {
        Ok(url) => {
            info!("reasoning endpoint: {url}");
            Some(Arc::new(HttpReasoningBackend::new(url)?))
        }
        Err(_) => {
            info!("no VOICE_REASONING_URL set, transcription-only mode");
            None
        }
    };

    match speech.health().await {
        Ok(health) => info!(
            "speech backend ready: stt_loaded={} tts_loaded={} device={}",
            health.stt_loaded, health.tts_loaded, health.device
        ),
        Err(e) => warn!("speech backend not reachable yet: {e}"),
    }

    let manager = SessionManager::new(config, Arc::clone(&speech), reasoning);
    let state = AppState { manager, speech };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/voice/ws", get(ws::voice_ws))
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!("voice gateway listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}

/// Liveness plus a passthrough of the speech backend's health.
async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    let backend = match state.speech.health().await {
        Ok(h) => json!({
            "status": h.status,
            "stt_loaded": h.stt_loaded,
            "tts_loaded": h.tts_loaded,
            "device": h.device,
        }),
        Err(e) => json!({ "status": "unreachable", "error": e.to_string() }),
    };
    Json(json!({
        "status": "ok",
        "active_sessions": state.manager.session_count(),
        "backend": backend,
    }))
}
