//! Session registry and per-connection drivers
//!
//! The manager owns the map of live sessions and spawns one driver task per
//! connection. The driver is the single consumer of a session's inbound
//! frames and turn completions, which is what keeps per-session handling
//! strictly sequential while different sessions proceed independently.

use crate::bridge::SpeechBackend;
use crate::config::EngineConfig;
use crate::orchestrator::{OrchestratorConfig, ReasoningBackend, ResponseOrchestrator};
use crate::protocol::WireMessage;
use crate::session::{Session, SessionId};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct SessionEntry {
    user_id: Option<String>,
    shutdown_tx: mpsc::UnboundedSender<()>,
}

/// Transport-facing handle for one connection: push inbound frames into
/// `in_tx`, forward everything from `out_rx` to the client.
pub struct SessionConnection {
    pub id: SessionId,
    pub in_tx: mpsc::UnboundedSender<WireMessage>,
    pub out_rx: mpsc::UnboundedReceiver<WireMessage>,
}

pub struct SessionManager {
    config: EngineConfig,
    speech: Arc<dyn SpeechBackend>,
    reasoning: Option<Arc<dyn ReasoningBackend>>,
    orchestrator: Arc<ResponseOrchestrator>,
    sessions: Arc<DashMap<SessionId, SessionEntry>>,
}

impl SessionManager {
    pub fn new(
        config: EngineConfig,
        speech: Arc<dyn SpeechBackend>,
        reasoning: Option<Arc<dyn ReasoningBackend>>,
    ) -> Arc<Self> {
        let orchestrator = Arc::new(ResponseOrchestrator::new(OrchestratorConfig {
            fast_ack_threshold: config.fast_ack_threshold,
            fast_ack_phrases: config.fast_ack_phrases.clone(),
            voice: Default::default(),
        }));
        Arc::new(Self {
            config,
            speech,
            reasoning,
            orchestrator,
            sessions: Arc::new(DashMap::new()),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }

    /// Register a new connection and spawn its driver. The driver exits, and
    /// the session is torn down, when the inbound channel closes (client
    /// disconnect), `disconnect` is called, or the idle timeout fires.
    pub fn connect(self: &Arc<Self>, user_id: Option<String>) -> SessionConnection {
        let (in_tx, mut in_rx) = mpsc::unbounded_channel::<WireMessage>();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<()>();

        let (mut session, mut events_rx) = Session::new(
            user_id.clone(),
            self.config.clone(),
            Arc::clone(&self.speech),
            self.reasoning.clone(),
            Arc::clone(&self.orchestrator),
            out_tx,
        );
        let id = session.id;
        session.send_ready();

        self.sessions.insert(
            id,
            SessionEntry {
                user_id,
                shutdown_tx,
            },
        );
        info!(session = %id, total = self.session_count(), "session connected");

        let idle_timeout = self.config.idle_timeout;
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let tick_every = (idle_timeout / 4).max(Duration::from_secs(1));
            let mut tick = tokio::time::interval(tick_every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    msg = in_rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(err) = session.handle_message(msg).await {
                                if err.is_turn_local() {
                                    session.report_error(&err);
                                } else {
                                    warn!(session = %id, "fatal session error: {err}");
                                    break;
                                }
                            }
                        }
                        None => {
                            debug!(session = %id, "client disconnected");
                            break;
                        }
                    },
                    event = events_rx.recv() => {
                        if let Some(event) = event {
                            session.handle_event(event).await;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(session = %id, "shutdown requested");
                        break;
                    }
                    _ = tick.tick() => {
                        if session.idle_for() >= idle_timeout {
                            info!(session = %id, "idle timeout, closing");
                            break;
                        }
                    }
                }
            }

            // Cancels any in-flight transcription or synthesis.
            session.close().await;
            // The removal gates the teardown log: whichever path gets here
            // first logs, later paths see the entry gone.
            if sessions.remove(&id).is_some() {
                info!(session = %id, remaining = sessions.len(), "session closed");
            }
        });

        SessionConnection { id, in_tx, out_rx }
    }

    /// Ask a session's driver to shut down. Safe to call for unknown or
    /// already-closed sessions.
    pub fn disconnect(&self, id: SessionId) {
        if let Some(entry) = self.sessions.get(&id) {
            let _ = entry.shutdown_tx.send(());
        }
    }

    pub fn user_of(&self, id: SessionId) -> Option<String> {
        self.sessions.get(&id).and_then(|e| e.user_id.clone())
    }
}
