//! Message segmenter and pacer — turns one completion into paced chat bubbles.
//!
//! DESIGN
//! ======
//! `segment` is pure: paragraphs split on blank lines, multi-line paragraphs
//! split per line, every candidate run through the formatter. It never
//! returns an empty list.
//!
//! `deliver` is one task of awaited delay-then-emit steps. Each step checks
//! that the session is still active before it mutates or emits, so ending a
//! session stops a delivery at its next step with no other teardown.
//! Deliveries for one session are serialized by the store's reply lock.

use uuid::Uuid;

use crate::services::events;
use crate::services::formatter::{Formatted, format_message};
use crate::state::{AppState, Speaker};

/// Sent when nothing in a completion survives formatting.
pub const FALLBACK_REPHRASE: &str = "hmm, let me rephrase that";

// =============================================================================
// SEGMENTATION
// =============================================================================

/// Raw candidates before formatting: paragraphs, then lines within them.
#[must_use]
pub fn split(raw: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            out.append(&mut paragraph);
        } else {
            paragraph.push(line.trim());
        }
    }
    out.append(&mut paragraph);
    out
}

/// Split and format a completion into emit-ready segments.
#[must_use]
pub fn segment(raw: Option<&str>) -> Vec<String> {
    let candidates = raw.map(split).unwrap_or_default();
    let total = candidates.len();

    let segments: Vec<String> = candidates
        .into_iter()
        .filter_map(|c| match format_message(Some(c)) {
            Formatted::Text(text) if !text.is_empty() => Some(text),
            _ => None,
        })
        .collect();

    if segments.is_empty() {
        tracing::debug!(candidates = total, "segmenter: nothing survived, using fallback");
        return vec![FALLBACK_REPHRASE.to_string()];
    }
    segments
}

// =============================================================================
// DELIVERY
// =============================================================================

/// Deliver segments under the session's reply lock. Returns how many were emitted.
pub async fn deliver(state: &AppState, session_id: Uuid, segments: &[String]) -> usize {
    let Some(lock) = state.store.reply_lock(session_id).await else {
        return 0;
    };
    let _guard = lock.lock().await;
    deliver_locked(state, session_id, segments).await
}

/// Deliver segments; the caller already holds the reply lock.
///
/// The first segment goes out immediately. Each later one is preceded by a
/// typing-on signal, a randomized pause, and typing-off. A segment is
/// appended to the session before it is emitted.
pub(crate) async fn deliver_locked(state: &AppState, session_id: Uuid, segments: &[String]) -> usize {
    let pacing = state.settings.pacing;
    let mut emitted = 0;

    for (index, text) in segments.iter().enumerate() {
        if index > 0 {
            if !state.store.is_active(session_id).await {
                break;
            }
            events::set_typing(state, session_id, true, Speaker::Ai).await;
            tokio::time::sleep(pacing.between_segments.sample()).await;
            events::set_typing(state, session_id, false, Speaker::Ai).await;
        }

        match events::post_message(state, session_id, Speaker::Ai, text.as_str(), None).await {
            Ok(_) => emitted += 1,
            Err(e) => {
                tracing::debug!(%session_id, error = %e, remaining = segments.len() - index, "segmenter: delivery stopped");
                break;
            }
        }
    }
    emitted
}

#[cfg(test)]
#[path = "segmenter_test.rs"]
mod tests;
