//! Prompt composition for persona replies and the read-only `PromptBlock`
//! view over the same inputs.
//!
//! The reply pipeline and the inspection endpoint share `system_instruction`,
//! `style_note` and `history`, so what `/prompt` shows is what the model gets.

use serde::Serialize;

use crate::llm::types::Message;
use crate::persona::Persona;
use crate::state::{ChatMessage, Session, Speaker};

/// Appended to every system instruction.
pub const STYLE_NOTE: &str = "You are texting in a casual one-on-one chat. Keep replies short, like real \
     text messages. You may send a few separate short messages by putting each on its own line. \
     Never describe actions or gestures in asterisks or brackets. Never say you are an AI.";

/// Instruction for the yes/no extension decision.
pub const DECISION_INSTRUCTION: &str = "The chat timer is almost up and the other person has been asked \
     whether to keep talking. Based on how the conversation went, do you want to keep chatting? \
     Answer with exactly one word: extend or decline.";

#[must_use]
pub fn persona_instruction(persona: &Persona) -> String {
    let mut out = format!("You are {}. Personality: {}.", persona.name, persona.personality);
    if let Some(description) = persona.description.as_deref().filter(|d| !d.trim().is_empty()) {
        out.push_str(" Background: ");
        out.push_str(description);
    }
    out
}

/// Persona instructions plus the style note.
#[must_use]
pub fn system_instruction(persona: &Persona) -> String {
    format!("{}\n\n{STYLE_NOTE}", persona_instruction(persona))
}

/// The most recent `window` messages as completion history.
#[must_use]
pub fn history(messages: &[ChatMessage], window: usize) -> Vec<Message> {
    let start = messages.len().saturating_sub(window);
    messages[start..]
        .iter()
        .map(|m| match m.sender {
            Speaker::User => Message::user(m.text.clone()),
            Speaker::Ai => Message::assistant(m.text.clone()),
        })
        .collect()
}

// =============================================================================
// PROMPT BLOCK
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PromptSegment {
    pub name: &'static str,
    pub text: String,
    pub estimated_tokens: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptBlock {
    pub segments: Vec<PromptSegment>,
    pub estimated_tokens: usize,
}

/// Rough token estimate: one token per four characters, rounded up.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

fn segment(name: &'static str, text: String) -> PromptSegment {
    let estimated_tokens = estimate_tokens(&text);
    PromptSegment { name, text, estimated_tokens }
}

/// Build the inspection view for a session. Never touches the store.
#[must_use]
pub fn prompt_block(session: &Session, window: usize) -> PromptBlock {
    let start = session.messages.len().saturating_sub(window);
    let transcript = session.messages[start..]
        .iter()
        .map(|m| match m.sender {
            Speaker::User => format!("user: {}", m.text),
            Speaker::Ai => format!("{}: {}", session.persona.name, m.text),
        })
        .collect::<Vec<_>>()
        .join("\n");

    let segments = vec![
        segment("system", persona_instruction(&session.persona)),
        segment("history", transcript),
        segment("style", STYLE_NOTE.to_string()),
    ];
    let estimated_tokens = segments.iter().map(|s| s.estimated_tokens).sum();
    PromptBlock { segments, estimated_tokens }
}

#[cfg(test)]
#[path = "prompt_test.rs"]
mod tests;
