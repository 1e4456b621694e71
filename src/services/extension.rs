//! Extension negotiation — the human and the persona each decide whether to
//! keep chatting when the clock runs low.
//!
//! DESIGN
//! ======
//! The offer itself is latched by the countdown tick in the store. This
//! module handles the rest of the cycle:
//!
//! 1. record the user's decision (final once submitted)
//! 2. ask the persona for its own decision
//! 3. resolve exactly once per offer and announce the outcome
//! 4. hand the outcome to the lifecycle, which applies it after a short
//!    display delay
//!
//! ERROR HANDLING
//! ==============
//! A failed or timed out decision call resolves to `Decline`, so a broken
//! completion backend can never keep a session alive indefinitely. An answer
//! that is neither word, or no backend at all, falls back to a biased coin.

use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::ErrorCode;
use crate::llm::types::Message;
use crate::services::reply::{self, CompletionError};
use crate::services::store::StoreError;
use crate::services::{events, lifecycle, prompt};
use crate::state::{AppState, Decision, Session};

/// Probability that the rule-based fallback chooses to extend.
pub const EXTEND_BIAS: f64 = 0.7;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtensionOutcome {
    pub user_decision: Decision,
    pub ai_decision: Decision,
    pub both_extend: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no extension has been offered for this session")]
    NotOffered,
    #[error("extension decision already submitted")]
    AlreadySubmitted,
}

impl ErrorCode for ExtensionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.error_code(),
            Self::NotOffered => "E_EXTENSION_NOT_OFFERED",
            Self::AlreadySubmitted => "E_DECISION_ALREADY_SUBMITTED",
        }
    }
}

// =============================================================================
// PURE RULES
// =============================================================================

/// Only (extend, extend) extends.
#[must_use]
pub fn resolve(user_decision: Decision, ai_decision: Decision) -> ExtensionOutcome {
    ExtensionOutcome {
        user_decision,
        ai_decision,
        both_extend: user_decision == Decision::Extend && ai_decision == Decision::Extend,
    }
}

/// Read a one-word answer. Ambiguous or unrelated answers are `None`.
#[must_use]
pub fn parse_decision(answer: &str) -> Option<Decision> {
    let answer = answer.to_ascii_lowercase();
    let words: Vec<&str> = answer
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|w| !w.is_empty())
        .collect();
    let extend = words.iter().any(|w| matches!(*w, "extend" | "yes" | "continue"));
    let decline = words.iter().any(|w| matches!(*w, "decline" | "no" | "end"));
    match (extend, decline) {
        (true, false) => Some(Decision::Extend),
        (false, true) => Some(Decision::Decline),
        _ => None,
    }
}

#[must_use]
pub fn random_decision() -> Decision {
    if rand::rng().random_bool(EXTEND_BIAS) { Decision::Extend } else { Decision::Decline }
}

// =============================================================================
// AI DECISION
// =============================================================================

/// Ask the persona whether it wants to keep going.
pub async fn ai_decision(state: &AppState, session: &Session) -> Decision {
    let system = prompt::system_instruction(&session.persona);
    let mut messages = prompt::history(&session.messages, state.settings.generation.history_window);
    messages.push(Message::user(prompt::DECISION_INSTRUCTION));

    let max_tokens = state.settings.generation.decision_max_tokens;
    match reply::complete_text(state, &system, &messages, max_tokens).await {
        Ok(answer) => parse_decision(&answer).unwrap_or_else(|| {
            let fallback = random_decision();
            info!(session_id = %session.id, %answer, ?fallback, "extension: unparseable answer, using fallback");
            fallback
        }),
        Err(CompletionError::NotConfigured) => random_decision(),
        Err(e) => {
            warn!(session_id = %session.id, error = %e, "extension: decision call failed, declining");
            Decision::Decline
        }
    }
}

// =============================================================================
// NEGOTIATION
// =============================================================================

/// Submit the user's decision and negotiate the outcome.
///
/// Broadcasts `session:extension` to the session's clients and schedules the
/// lifecycle to apply the outcome.
///
/// # Errors
///
/// - [`ExtensionError::NotOffered`] before the warning threshold
/// - [`ExtensionError::AlreadySubmitted`] on a second submission in a cycle
/// - [`ExtensionError::Store`] for unknown or ended sessions
pub async fn request_extension(
    state: &AppState,
    session_id: Uuid,
    user_decision: Decision,
) -> Result<ExtensionOutcome, ExtensionError> {
    state
        .store
        .update_extension(session_id, |ext| {
            if !ext.has_been_offered {
                return Err(ExtensionError::NotOffered);
            }
            if ext.user_decision.is_some() {
                return Err(ExtensionError::AlreadySubmitted);
            }
            ext.user_decision = Some(user_decision);
            Ok(())
        })
        .await??;
    info!(%session_id, ?user_decision, "extension: user decided");

    let session = state.store.get(session_id).await?;
    let ai = ai_decision(state, &session).await;

    let outcome = state
        .store
        .update_extension(session_id, |ext| {
            ext.ai_decision = Some(ai);
            if ext.resolved {
                return None;
            }
            ext.resolved = true;
            Some(resolve(user_decision, ai))
        })
        .await?;
    // The user decision gate above admits one caller per cycle, so the
    // resolved latch is only ever taken here.
    let Some(outcome) = outcome else {
        return Err(ExtensionError::AlreadySubmitted);
    };

    info!(%session_id, ?user_decision, ai_decision = ?ai, both_extend = outcome.both_extend, "extension: resolved");
    state
        .store
        .broadcast(
            session_id,
            &events::extension_response(session_id, user_decision, ai, outcome.both_extend),
            None,
        )
        .await;

    let task_state = state.clone();
    tokio::spawn(async move {
        lifecycle::apply_extension_outcome(&task_state, session_id, outcome).await;
    });

    Ok(outcome)
}

#[cfg(test)]
#[path = "extension_test.rs"]
mod tests;
