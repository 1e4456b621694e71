//! Reply service — the persona's side of the conversation.
//!
//! DESIGN
//! ======
//! `respond` runs once per user message, under the session's reply lock:
//!
//! 1. thinking pause (the persona "reads" the message)
//! 2. typing on
//! 3. completion call, joined with a composing pause so fast models still
//!    look like someone typing
//! 4. typing off, then paced delivery of the segments
//!
//! ERROR HANDLING
//! ==============
//! A failed, timed out, or text-free completion becomes one apologetic
//! bubble. Nothing here returns an error to the transport.

use uuid::Uuid;

use crate::frame::ErrorCode;
use crate::llm::types::{ChatRequest, LlmError, Message};
use crate::services::{events, prompt, segmenter};
use crate::state::{AppState, Session, Speaker};

/// Sent when the completion capability fails or returns no text.
pub const FALLBACK_APOLOGY: &str = "sorry, I totally lost my train of thought there. what were you saying?";

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("text completion is not configured")]
    NotConfigured,
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("completion contained no text")]
    Empty,
}

impl ErrorCode for CompletionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotConfigured => "E_LLM_NOT_CONFIGURED",
            Self::Llm(e) => e.error_code(),
            Self::Empty => "E_LLM_EMPTY",
        }
    }
}

/// One bounded completion call returning the reply text.
///
/// # Errors
///
/// Returns [`CompletionError`] when no client is configured, the call fails
/// or exceeds the completion timeout, or the response has no text.
pub async fn complete_text(
    state: &AppState,
    system: &str,
    messages: &[Message],
    max_tokens: u32,
) -> Result<String, CompletionError> {
    let Some(llm) = &state.llm else {
        return Err(CompletionError::NotConfigured);
    };
    let generation = state.settings.generation;
    let request = ChatRequest { system, messages, max_tokens, temperature: generation.temperature };

    let response = tokio::time::timeout(generation.completion_timeout, llm.chat(&request))
        .await
        .map_err(|_| LlmError::Timeout { secs: generation.completion_timeout.as_secs() })??;

    tracing::debug!(
        model = %response.model,
        input_tokens = response.input_tokens,
        output_tokens = response.output_tokens,
        stop_reason = %response.stop_reason,
        "reply: completion received"
    );
    response.text().ok_or(CompletionError::Empty)
}

async fn generate(state: &AppState, session: &Session) -> Result<String, CompletionError> {
    let generation = state.settings.generation;
    let system = prompt::system_instruction(&session.persona);
    let history = prompt::history(&session.messages, generation.history_window);
    complete_text(state, &system, &history, generation.max_tokens).await
}

/// Produce the persona's reply to the latest user message.
pub async fn respond(state: &AppState, session_id: Uuid) {
    let Some(lock) = state.store.reply_lock(session_id).await else {
        return;
    };
    let _guard = lock.lock().await;
    let pacing = state.settings.pacing;

    tokio::time::sleep(pacing.thinking.sample()).await;

    // Re-fetch after the pause: the session may have ended meanwhile.
    let session = match state.store.get(session_id).await {
        Ok(s) if s.is_active => s,
        _ => return,
    };

    events::set_typing(state, session_id, true, Speaker::Ai).await;
    let (_, completion) = futures::join!(tokio::time::sleep(pacing.composing.sample()), generate(state, &session));

    let segments = match completion {
        Ok(text) => segmenter::segment(Some(&text)),
        Err(e) => {
            tracing::warn!(%session_id, error = %e, "reply: completion failed, sending fallback");
            vec![FALLBACK_APOLOGY.to_string()]
        }
    };

    events::set_typing(state, session_id, false, Speaker::Ai).await;
    let emitted = segmenter::deliver_locked(state, session_id, &segments).await;
    tracing::info!(%session_id, segments = segments.len(), emitted, "reply: delivered");
}

#[cfg(test)]
#[path = "reply_test.rs"]
mod tests;
