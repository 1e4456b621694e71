//! WebSocket handler — bidirectional frame relay between a client and its
//! current chat session.
//!
//! DESIGN
//! ======
//! On upgrade, generates a client ID and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Session events (paced AI messages, typing, clock, extension, rollover)
//!   → forward to client
//!
//! Handler functions validate, call into the services, and return an
//! `Outcome`. The dispatch layer owns the reply to the sender and the
//! forwarding to peers.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `session:connected` with `client_id`
//! 2. `session:join` binds the client's channel to a session and starts its
//!    clock on first join
//! 3. A forwarded `session:joined` with a new id means the session rolled
//!    over; the connection follows it
//! 4. Close → unbind from the current session. The session keeps running.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::{Data, Frame, data_from};
use crate::services::lifecycle::{self, EndReason};
use crate::services::store::StoreError;
use crate::services::{events, extension, reply};
use crate::state::{AppState, Decision, Speaker};

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide who receives what.
#[derive(Debug)]
enum Outcome {
    /// Send done+data to sender only.
    Reply(Data),
    /// Send empty done to sender only.
    Done,
    /// Forward an event to the session's other clients. No reply to sender.
    /// Used for typing indicators.
    NotifyPeers(Frame),
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4();

    // Per-connection channel for session events.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(256);

    let welcome = Frame::request("session:connected", Data::new()).with_data("client_id", client_id.to_string());
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }

    info!(%client_id, "ws: client connected");

    let mut current_session: Option<Uuid> = None;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let sender_frames =
                            process_inbound_text(&state, &mut current_session, client_id, &client_tx, &text).await;
                        for frame in sender_frames {
                            let _ = send_frame(&mut socket, &frame).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                follow_rollover(&mut current_session, client_id, &frame);
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(session_id) = current_session {
        state.store.unbind_client(session_id, client_id).await;
    }
    info!(%client_id, "ws: client disconnected");
}

/// Rollover moves client channels to the successor session and announces it
/// with `session:joined`. Track it so later inbound frames target the new id.
fn follow_rollover(current_session: &mut Option<Uuid>, client_id: Uuid, frame: &Frame) {
    if frame.syscall != events::SESSION_JOINED {
        return;
    }
    let Some(next) = frame.session_id else {
        return;
    };
    if *current_session != Some(next) {
        info!(%client_id, previous = ?current_session, session_id = %next, "ws: following rollover");
        *current_session = Some(next);
    }
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
///
/// Kept apart from the socket so tests can drive dispatch with plain channels.
async fn process_inbound_text(
    state: &AppState,
    current_session: &mut Option<Uuid>,
    client_id: Uuid,
    client_tx: &mpsc::Sender<Frame>,
    text: &str,
) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%client_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new()).with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };

    req.from = Some(client_id.to_string());

    let prefix = req.prefix();
    if prefix == "typing" {
        debug!(%client_id, syscall = %req.syscall, "ws: recv frame");
    } else {
        info!(%client_id, id = %req.id, syscall = %req.syscall, "ws: recv frame");
    }

    let result = match prefix {
        "session" => handle_session(state, current_session, client_id, client_tx, &req).await,
        "message" => handle_message(state, *current_session, client_id, &req).await,
        "typing" => handle_typing(state, *current_session, &req).await,
        _ => Err(req.error(format!("unknown prefix: {prefix}"))),
    };

    let session_id = *current_session;
    let stamp = |frame: Frame| match (frame.session_id, session_id) {
        (None, Some(id)) => frame.with_session_id(id),
        _ => frame,
    };

    match result {
        Ok(Outcome::Reply(data)) => vec![stamp(req.done_with(data))],
        Ok(Outcome::Done) => vec![stamp(req.done())],
        Ok(Outcome::NotifyPeers(frame)) => {
            if let Some(sid) = session_id {
                state.store.broadcast(sid, &frame, Some(client_id)).await;
            }
            vec![]
        }
        Err(err_frame) => vec![err_frame],
    }
}

/// The session an in-session request applies to. A frame naming a session
/// other than the joined one is rejected.
fn joined_session(current_session: Option<Uuid>, req: &Frame) -> Result<Uuid, Frame> {
    let Some(current) = current_session else {
        return Err(req.error("must join a session first"));
    };
    match req.target_session() {
        Some(other) if other != current => Err(req.error(format!("not joined to session {other}"))),
        _ => Ok(current),
    }
}

// =============================================================================
// SESSION HANDLERS
// =============================================================================

async fn handle_session(
    state: &AppState,
    current_session: &mut Option<Uuid>,
    client_id: Uuid,
    client_tx: &mpsc::Sender<Frame>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    match req.op() {
        "join" => {
            let Some(session_id) = req.target_session() else {
                return Err(req.error("session_id required"));
            };

            // Bind first so a failed join leaves the current binding intact.
            if let Err(e) = state
                .store
                .bind_client(session_id, client_id, client_tx.clone())
                .await
            {
                return Err(req.error_from(&e));
            }
            if let Some(old) = current_session.replace(session_id) {
                if old != session_id {
                    state.store.unbind_client(old, client_id).await;
                }
            }

            lifecycle::start(state, session_id).await;
            let snapshot = state
                .store
                .get(session_id)
                .await
                .map_err(|e| req.error_from(&e))?;
            info!(%client_id, %session_id, persona = %snapshot.persona.id, "ws: joined session");

            let data = events::joined_data(&snapshot, state.settings.session_duration_minutes());
            Ok(Outcome::Reply(data))
        }
        "extend" => {
            let session_id = joined_session(*current_session, req)?;
            let Some(decision) = req
                .data
                .get("decision")
                .cloned()
                .and_then(|v| serde_json::from_value::<Decision>(v).ok())
            else {
                return Err(req.error("decision must be extend or decline"));
            };

            match extension::request_extension(state, session_id, decision).await {
                Ok(outcome) => Ok(Outcome::Reply(data_from(&outcome))),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "end" => {
            let session_id = joined_session(*current_session, req)?;
            state
                .store
                .get(session_id)
                .await
                .map_err(|e| req.error_from(&e))?;
            if !lifecycle::end_session(state, session_id, EndReason::Manual).await {
                return Err(req.error_from(&StoreError::Inactive(session_id)));
            }
            Ok(Outcome::Done)
        }
        op => Err(req.error(format!("unknown session op: {op}"))),
    }
}

// =============================================================================
// MESSAGE HANDLER
// =============================================================================

async fn handle_message(
    state: &AppState,
    current_session: Option<Uuid>,
    client_id: Uuid,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let session_id = joined_session(current_session, req)?;

    match req.op() {
        "send" => {
            let text = req
                .data
                .get("text")
                .and_then(|v| v.as_str())
                .map_or("", str::trim);
            if text.is_empty() {
                return Err(req.error("text required"));
            }

            let message = events::post_message(state, session_id, Speaker::User, text, Some(client_id))
                .await
                .map_err(|e| req.error_from(&e))?;

            let task_state = state.clone();
            tokio::spawn(async move {
                reply::respond(&task_state, session_id).await;
            });

            Ok(Outcome::Reply(data_from(&message)))
        }
        op => Err(req.error(format!("unknown message op: {op}"))),
    }
}

// =============================================================================
// TYPING HANDLER
// =============================================================================

async fn handle_typing(state: &AppState, current_session: Option<Uuid>, req: &Frame) -> Result<Outcome, Frame> {
    let Some(session_id) = current_session else {
        // Silently ignore typing before joining.
        return Ok(Outcome::Done);
    };
    if !state.store.is_active(session_id).await {
        return Err(req.error_from(&StoreError::Inactive(session_id)));
    }

    match req.op() {
        "status" => {
            let is_typing = req
                .data
                .get("is_typing")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            let sender = req
                .data
                .get("sender")
                .cloned()
                .and_then(|v| serde_json::from_value::<Speaker>(v).ok())
                .unwrap_or(Speaker::User);
            Ok(Outcome::NotifyPeers(events::typing(session_id, is_typing, sender)))
        }
        op => Err(req.error(format!("unknown typing op: {op}"))),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == crate::frame::Status::Error {
        let code = frame
            .data
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        let message = frame
            .data
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else if frame.syscall == events::TYPING_UPDATE || frame.syscall == events::SESSION_CLOCK {
        debug!(id = %frame.id, syscall = %frame.syscall, "ws: send frame");
    } else {
        info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
