//! Shared application state and the session data model.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor and
//! cloned into every background task. It holds the session store, the
//! persona roster, the optional completion client, and the settings read at
//! startup. Nothing here is global: tests build their own `AppState`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Settings;
use crate::llm::LlmChat;
use crate::persona::{Persona, PersonaStore};
use crate::services::store::SessionStore;

// =============================================================================
// MESSAGES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Ai,
}

/// One chat bubble. Immutable once appended to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub text: String,
    pub sender: Speaker,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    #[must_use]
    pub fn new(sender: Speaker, text: impl Into<String>) -> Self {
        Self { id: Uuid::new_v4(), text: text.into(), sender, timestamp: Utc::now() }
    }
}

// =============================================================================
// EXTENSION STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Extend,
    Decline,
}

/// Per-cycle negotiation state. Back to `default()` after a successful extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionState {
    pub user_decision: Option<Decision>,
    pub ai_decision: Option<Decision>,
    pub has_been_offered: bool,
    /// Set when the outcome for this offer has been taken. Never reset within a cycle.
    #[serde(skip)]
    pub resolved: bool,
}

// =============================================================================
// SESSION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// Created, no client has joined yet. The clock is not running.
    Connecting,
    Active,
    /// Extension offered, waiting on decisions. The clock keeps running.
    Extending,
    Ending,
    Ended,
}

/// Countdown display split. Ticking borrows a minute when seconds underflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clock {
    pub minutes: u64,
    pub seconds: u64,
}

impl Clock {
    #[must_use]
    pub fn from_secs(total: u64) -> Self {
        Self { minutes: total / 60, seconds: total % 60 }
    }

    #[must_use]
    pub fn total_secs(self) -> u64 {
        self.minutes * 60 + self.seconds
    }

    /// One second down. Saturates at 0:00.
    #[must_use]
    pub fn tick(self) -> Self {
        match (self.minutes, self.seconds) {
            (0, 0) => self,
            (m, 0) => Self { minutes: m - 1, seconds: 59 },
            (m, s) => Self { minutes: m, seconds: s - 1 },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub persona: Persona,
    pub messages: Vec<ChatMessage>,
    pub time_remaining_secs: u64,
    pub is_active: bool,
    pub phase: SessionPhase,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub extension: ExtensionState,
}

impl Session {
    #[must_use]
    pub fn new(persona: Persona, duration_secs: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            persona,
            messages: Vec::new(),
            time_remaining_secs: duration_secs,
            is_active: true,
            phase: SessionPhase::Connecting,
            created_at: Utc::now(),
            ended_at: None,
            extension: ExtensionState::default(),
        }
    }

    #[must_use]
    pub fn clock(&self) -> Clock {
        Clock::from_secs(self.time_remaining_secs)
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; every field is a cheap handle.
#[derive(Clone)]
pub struct AppState {
    pub store: SessionStore,
    pub personas: Arc<dyn PersonaStore>,
    /// Optional LLM client. `None` if LLM env vars are not configured.
    pub llm: Option<Arc<dyn LlmChat>>,
    pub settings: Arc<Settings>,
}

impl AppState {
    #[must_use]
    pub fn new(personas: Arc<dyn PersonaStore>, llm: Option<Arc<dyn LlmChat>>, settings: Settings) -> Self {
        Self { store: SessionStore::new(), personas, llm, settings: Arc::new(settings) }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::config::Pacing;
    use crate::frame::Frame;
    use crate::llm::types::{ChatRequest, ChatResponse, ContentBlock, LlmError, Message};
    use crate::persona::StaticPersonaStore;

    /// Settings with every pacing delay at zero.
    #[must_use]
    pub fn test_settings() -> Settings {
        Settings { pacing: Pacing::immediate(), ..Settings::default() }
    }

    /// Create a test `AppState` with built-in personas and no LLM.
    #[must_use]
    pub fn test_app_state() -> AppState {
        AppState::new(Arc::new(StaticPersonaStore::builtin()), None, test_settings())
    }

    /// Create a test `AppState` with a mock LLM.
    #[must_use]
    pub fn test_app_state_with_llm(llm: Arc<dyn LlmChat>) -> AppState {
        AppState::new(Arc::new(StaticPersonaStore::builtin()), Some(llm), test_settings())
    }

    /// Same as [`test_app_state_with_llm`] with caller-supplied settings.
    #[must_use]
    pub fn test_app_state_with(llm: Option<Arc<dyn LlmChat>>, settings: Settings) -> AppState {
        AppState::new(Arc::new(StaticPersonaStore::builtin()), llm, settings)
    }

    /// Create a session with the first built-in persona and return its ID.
    pub async fn seed_session(state: &AppState) -> Uuid {
        let persona = state.personas.list().remove(0);
        state
            .store
            .create(persona, state.settings.session_duration_secs)
            .await
            .id
    }

    /// Bind a fresh client channel to a session and return its receiver.
    pub async fn attach_client(state: &AppState, session_id: Uuid) -> (Uuid, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(256);
        let client_id = Uuid::new_v4();
        state
            .store
            .bind_client(session_id, client_id, tx)
            .await
            .expect("bind client");
        (client_id, rx)
    }

    /// Next frame on a client channel, or `None` after a quiet period.
    pub async fn next_frame(rx: &mut mpsc::Receiver<Frame>) -> Option<Frame> {
        tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Drain frames until one with `syscall` arrives; returns it and the
    /// syscalls skipped on the way.
    pub async fn frame_with_syscall(rx: &mut mpsc::Receiver<Frame>, syscall: &str) -> (Frame, Vec<String>) {
        let mut skipped = Vec::new();
        loop {
            let frame = next_frame(rx)
                .await
                .unwrap_or_else(|| panic!("no {syscall} frame; saw {skipped:?}"));
            if frame.syscall == syscall {
                return (frame, skipped);
            }
            skipped.push(frame.syscall);
        }
    }

    #[must_use]
    pub fn text_response(text: &str) -> ChatResponse {
        ChatResponse {
            content: vec![ContentBlock::Text { text: text.into() }],
            model: "mock".into(),
            stop_reason: "end_turn".into(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    /// Scripted completion client. Responses are consumed in order; once the
    /// script runs out every call answers "ok". Requests are recorded.
    pub struct MockLlm {
        responses: Mutex<Vec<Result<ChatResponse, LlmError>>>,
        pub calls: Mutex<Vec<(String, Vec<Message>, u32)>>,
    }

    impl MockLlm {
        #[must_use]
        pub fn new(responses: Vec<Result<ChatResponse, LlmError>>) -> Self {
            Self { responses: Mutex::new(responses), calls: Mutex::new(Vec::new()) }
        }

        #[must_use]
        pub fn texts(texts: &[&str]) -> Self {
            Self::new(texts.iter().map(|t| Ok(text_response(t))).collect())
        }

        #[must_use]
        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl LlmChat for MockLlm {
        async fn chat(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, LlmError> {
            self.calls
                .lock()
                .unwrap()
                .push((request.system.to_string(), request.messages.to_vec(), request.max_tokens));
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() { Ok(text_response("ok")) } else { responses.remove(0) }
        }
    }

    /// Completion client that never answers.
    pub struct HangingLlm;

    #[async_trait::async_trait]
    impl LlmChat for HangingLlm {
        async fn chat(&self, _request: &ChatRequest<'_>) -> Result<ChatResponse, LlmError> {
            std::future::pending().await
        }
    }
}
