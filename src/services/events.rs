//! Outbound session events. One builder per server-initiated syscall so the
//! wire shape of each event lives in one place.

use serde_json::json;
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::services::lifecycle::EndReason;
use crate::services::store::StoreError;
use crate::state::{AppState, ChatMessage, Decision, Session, Speaker};

pub const SESSION_JOINED: &str = "session:joined";
pub const SESSION_ENDED: &str = "session:ended";
pub const SESSION_EXTENSION: &str = "session:extension";
pub const SESSION_EXTENSION_OFFER: &str = "session:extension-offer";
pub const SESSION_CLOCK: &str = "session:clock";
pub const MESSAGE_NEW: &str = "message:new";
pub const TYPING_UPDATE: &str = "typing:update";

fn event(syscall: &str, session_id: Uuid, data: Data) -> Frame {
    Frame::request(syscall, data)
        .with_session_id(session_id)
        .with_from("server")
}

#[must_use]
pub fn joined_data(session: &Session, duration_minutes: u64) -> Data {
    let mut data = Data::new();
    data.insert("session".into(), serde_json::to_value(session).unwrap_or_default());
    data.insert("clock".into(), serde_json::to_value(session.clock()).unwrap_or_default());
    data.insert("duration_minutes".into(), json!(duration_minutes));
    data
}

#[must_use]
pub fn session_joined(session: &Session, duration_minutes: u64) -> Frame {
    event(SESSION_JOINED, session.id, joined_data(session, duration_minutes))
}

#[must_use]
pub fn new_message(session_id: Uuid, message: &ChatMessage) -> Frame {
    event(MESSAGE_NEW, session_id, crate::frame::data_from(message))
}

#[must_use]
pub fn typing(session_id: Uuid, is_typing: bool, sender: Speaker) -> Frame {
    event(TYPING_UPDATE, session_id, Data::new())
        .with_data("is_typing", is_typing)
        .with_data("sender", json!(sender))
}

#[must_use]
pub fn extension_offer(session_id: Uuid, remaining_secs: u64) -> Frame {
    event(SESSION_EXTENSION_OFFER, session_id, Data::new()).with_data("time_remaining_secs", remaining_secs)
}

#[must_use]
pub fn extension_response(session_id: Uuid, user: Decision, ai: Decision, success: bool) -> Frame {
    event(SESSION_EXTENSION, session_id, Data::new())
        .with_data("user_decision", json!(user))
        .with_data("ai_decision", json!(ai))
        .with_data("success", success)
}

#[must_use]
pub fn clock(session_id: Uuid, remaining_secs: u64) -> Frame {
    let clock = crate::state::Clock::from_secs(remaining_secs);
    event(SESSION_CLOCK, session_id, Data::new())
        .with_data("time_remaining_secs", remaining_secs)
        .with_data("minutes", clock.minutes)
        .with_data("seconds", clock.seconds)
}

#[must_use]
pub fn ended(session_id: Uuid, reason: EndReason) -> Frame {
    event(SESSION_ENDED, session_id, Data::new()).with_data("reason", json!(reason))
}

/// Append a message, then tell every bound client about it. The append comes
/// first so a client that reconnects mid-delivery sees it in its snapshot.
///
/// # Errors
///
/// Returns a [`StoreError`] when the session is gone or ended; nothing is emitted.
pub async fn post_message(
    state: &AppState,
    session_id: Uuid,
    sender: Speaker,
    text: impl Into<String>,
    exclude: Option<Uuid>,
) -> Result<ChatMessage, StoreError> {
    let message = ChatMessage::new(sender, text);
    state
        .store
        .append_message(session_id, message.clone())
        .await?;
    state
        .store
        .broadcast(session_id, &new_message(session_id, &message), exclude)
        .await;
    Ok(message)
}

/// Broadcast a typing indicator, skipped if the session has ended.
pub async fn set_typing(state: &AppState, session_id: Uuid, is_typing: bool, sender: Speaker) {
    if is_typing && !state.store.is_active(session_id).await {
        return;
    }
    state
        .store
        .broadcast(session_id, &typing(session_id, is_typing, sender), None)
        .await;
}
