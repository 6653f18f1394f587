use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::providers::{GenerationRequest, LlmProvider, StreamChunk};

/// Events delivered to a session's caller: zero or more chunks, then exactly
/// one of complete or error per submitted request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Chunk {
        text: String,
    },
    Complete {
        #[serde(rename = "full_text")]
        full_text: String,
    },
    Error {
        message: String,
    },
}

enum SessionState {
    Idle,
    Generating(CancellationToken),
}

struct Session {
    state: SessionState,
    events_tx: mpsc::Sender<SessionEvent>,
}

/// Caller's end of one open session.
pub struct SessionHandle {
    pub id: String,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Owns all open sessions and drives generations against the provider.
#[derive(Clone)]
pub struct StreamCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: DashMap<String, Session>,
    provider: Arc<dyn LlmProvider>,
}

impl StreamCoordinator {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                provider,
            }),
        }
    }

    /// Open a session and hand back its id plus the event receiver.
    pub fn open_session(&self) -> SessionHandle {
        let id = Uuid::new_v4().to_string();
        let (events_tx, events) = mpsc::channel(64);
        self.inner.sessions.insert(
            id.clone(),
            Session {
                state: SessionState::Idle,
                events_tx,
            },
        );
        tracing::debug!(session = %id, "session opened");
        SessionHandle { id, events }
    }

    /// Start one generation for the session. Rejected while a previous
    /// generation is still in flight, or when no provider credential is
    /// configured.
    pub fn submit(
        &self,
        session_id: &str,
        prompt: String,
        system_instruction: Option<String>,
    ) -> EngineResult<()> {
        if !self.inner.provider.is_configured() {
            return Err(EngineError::Configuration(format!(
                "{} API key missing",
                self.inner.provider.name()
            )));
        }

        let (cancel, events_tx) = {
            let mut session = self
                .inner
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| EngineError::NotFound("session".into()))?;

            if matches!(session.state, SessionState::Generating(_)) {
                return Err(EngineError::SessionBusy);
            }

            let cancel = CancellationToken::new();
            session.state = SessionState::Generating(cancel.clone());
            (cancel, session.events_tx.clone())
        };

        let inner = Arc::clone(&self.inner);
        let session_id = session_id.to_string();
        let request = GenerationRequest {
            prompt,
            system_instruction,
            api_key: None,
        };

        tokio::spawn(async move {
            run_generation(&inner, &session_id, request, cancel, events_tx).await;
        });

        Ok(())
    }

    /// Close a session: cancel any in-flight generation and drop its state.
    /// Nothing is delivered for this session afterwards.
    pub fn close_session(&self, session_id: &str) {
        if let Some((_, session)) = self.inner.sessions.remove(session_id) {
            if let SessionState::Generating(cancel) = session.state {
                cancel.cancel();
            }
            tracing::debug!(session = %session_id, "session closed");
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }
}

/// Forward provider output to the session until completion, upstream error,
/// or cancellation. Exactly one terminal event is emitted unless the session
/// was closed, in which case nothing more is delivered.
async fn run_generation(
    inner: &Inner,
    session_id: &str,
    request: GenerationRequest,
    cancel: CancellationToken,
    events_tx: mpsc::Sender<SessionEvent>,
) {
    let outcome = tokio::select! {
        _ = cancel.cancelled() => None,
        result = drive_stream(inner, &request, &cancel, &events_tx) => result,
    };

    match outcome {
        None => {
            tracing::debug!(session = %session_id, "generation cancelled");
        }
        Some(terminal) => {
            // Closed sessions have dropped the receiver; the failed send is
            // deliberate silence, not an error.
            let _ = events_tx.send(terminal).await;
        }
    }

    if let Some(mut session) = inner.sessions.get_mut(session_id) {
        session.state = SessionState::Idle;
    }
}

/// Pump chunks from the provider, accumulating the full text. Returns the
/// terminal event for this generation, or `None` when the session went away
/// mid-stream and nothing more may be delivered.
async fn drive_stream(
    inner: &Inner,
    request: &GenerationRequest,
    cancel: &CancellationToken,
    events_tx: &mpsc::Sender<SessionEvent>,
) -> Option<SessionEvent> {
    let mut rx = match inner.provider.generate_stream(request).await {
        Ok(rx) => rx,
        Err(e) => {
            return Some(SessionEvent::Error {
                message: e.to_string(),
            })
        }
    };

    let mut full_text = String::new();
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                // Upstream receiver is dropped here, releasing the
                // generation; accumulated text goes with it.
                return None;
            }
            chunk = rx.recv() => chunk,
        };

        match chunk {
            Some(Ok(StreamChunk::TextDelta(text))) => {
                full_text.push_str(&text);
                if events_tx
                    .send(SessionEvent::Chunk { text })
                    .await
                    .is_err()
                {
                    // Caller went away; stop pulling from upstream.
                    return None;
                }
            }
            Some(Err(e)) => {
                return Some(SessionEvent::Error {
                    message: e.to_string(),
                })
            }
            None => return Some(SessionEvent::Complete { full_text }),
        }
    }
}
