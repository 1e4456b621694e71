use super::*;
use crate::frame::Status;
use crate::llm::LlmChat;
use crate::state::test_helpers::{self, MockLlm};
use crate::state::SessionPhase;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::time::{Duration, timeout};

fn request_text(syscall: &str, session_id: Option<Uuid>, data: serde_json::Value) -> String {
    let data: Data = serde_json::from_value(data).unwrap();
    let mut req = Frame::request(syscall, data);
    req.session_id = session_id;
    serde_json::to_string(&req).unwrap()
}

struct Conn {
    client_id: Uuid,
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
    current: Option<Uuid>,
}

impl Conn {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(256);
        Self { client_id: Uuid::new_v4(), tx, rx, current: None }
    }

    async fn send(&mut self, state: &AppState, text: &str) -> Vec<Frame> {
        process_inbound_text(state, &mut self.current, self.client_id, &self.tx, text).await
    }

    async fn join(&mut self, state: &AppState, session_id: Uuid) -> Frame {
        let mut frames = self
            .send(state, &request_text("session:join", Some(session_id), json!({})))
            .await;
        assert_eq!(frames.len(), 1);
        frames.remove(0)
    }
}

fn assert_error(frames: &[Frame], code: Option<&str>) {
    assert_eq!(frames.len(), 1, "{frames:?}");
    assert_eq!(frames[0].status, Status::Error);
    if let Some(code) = code {
        assert_eq!(frames[0].data["code"], code);
    }
}

async fn assert_no_frame(rx: &mut mpsc::Receiver<Frame>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected no frame"
    );
}

// =============================================================================
// GATEWAY
// =============================================================================

#[tokio::test]
async fn invalid_json_returns_gateway_error() {
    let state = test_helpers::test_app_state();
    let mut conn = Conn::new();
    let frames = conn.send(&state, "{not json").await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].syscall, "gateway:error");
    assert!(frames[0].data["message"].as_str().unwrap().starts_with("invalid json"));
}

#[tokio::test]
async fn unknown_prefix_and_op_return_errors() {
    let state = test_helpers::test_app_state();
    let mut conn = Conn::new();
    assert_error(&conn.send(&state, &request_text("board:join", None, json!({}))).await, None);

    let id = test_helpers::seed_session(&state).await;
    conn.join(&state, id).await;
    let frames = conn.send(&state, &request_text("session:pause", None, json!({}))).await;
    assert_error(&frames, None);
    assert!(frames[0].data["message"].as_str().unwrap().contains("pause"));
}

// =============================================================================
// SESSION
// =============================================================================

#[tokio::test]
async fn join_requires_session_id() {
    let state = test_helpers::test_app_state();
    let mut conn = Conn::new();
    let frames = conn.send(&state, &request_text("session:join", None, json!({}))).await;
    assert_error(&frames, None);
    assert!(conn.current.is_none());
}

#[tokio::test]
async fn join_unknown_session_is_not_found() {
    let state = test_helpers::test_app_state();
    let mut conn = Conn::new();
    let frames = conn
        .send(&state, &request_text("session:join", Some(Uuid::new_v4()), json!({})))
        .await;
    assert_error(&frames, Some("E_SESSION_NOT_FOUND"));
    assert!(conn.current.is_none());
}

#[tokio::test(start_paused = true)]
async fn join_binds_starts_clock_and_replies_with_snapshot() {
    let state = test_helpers::test_app_state();
    let id = test_helpers::seed_session(&state).await;
    let mut conn = Conn::new();

    let reply = conn.join(&state, id).await;
    assert_eq!(reply.status, Status::Done);
    assert_eq!(reply.syscall, "session:join");
    assert_eq!(reply.session_id, Some(id));
    assert_eq!(reply.data["session"]["id"], id.to_string());
    assert_eq!(reply.data["session"]["phase"], "active");
    assert_eq!(reply.data["duration_minutes"], state.settings.session_duration_minutes());
    assert_eq!(conn.current, Some(id));
    assert_eq!(state.store.client_count(id).await, 1);

    let (clock, _) = test_helpers::frame_with_syscall(&mut conn.rx, events::SESSION_CLOCK).await;
    assert_eq!(clock.data["time_remaining_secs"], state.settings.session_duration_secs - 1);
}

#[tokio::test]
async fn join_accepts_session_id_in_data() {
    let state = test_helpers::test_app_state();
    let id = test_helpers::seed_session(&state).await;
    let mut conn = Conn::new();
    let frames = conn
        .send(&state, &request_text("session:join", None, json!({ "session_id": id.to_string() })))
        .await;
    assert_eq!(frames[0].status, Status::Done);
    assert_eq!(frames[0].session_id, Some(id));
}

#[tokio::test]
async fn rejoin_moves_binding() {
    let state = test_helpers::test_app_state();
    let first = test_helpers::seed_session(&state).await;
    let second = test_helpers::seed_session(&state).await;
    let mut conn = Conn::new();

    conn.join(&state, first).await;
    conn.join(&state, second).await;

    assert_eq!(conn.current, Some(second));
    assert_eq!(state.store.client_count(first).await, 0);
    assert_eq!(state.store.client_count(second).await, 1);
}

#[tokio::test]
async fn join_ended_session_is_inactive() {
    let state = test_helpers::test_app_state();
    let id = test_helpers::seed_session(&state).await;
    state.store.mark_ended(id).await.unwrap();
    let mut conn = Conn::new();
    let frames = conn.send(&state, &request_text("session:join", Some(id), json!({}))).await;
    assert_error(&frames, Some("E_SESSION_INACTIVE"));
}

#[tokio::test]
async fn end_marks_inactive_and_notifies() {
    let state = test_helpers::test_app_state_with(
        None,
        crate::config::Settings { auto_reconnect: false, ..test_helpers::test_settings() },
    );
    let id = test_helpers::seed_session(&state).await;
    let mut conn = Conn::new();
    conn.join(&state, id).await;

    let frames = conn.send(&state, &request_text("session:end", Some(id), json!({}))).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Done);

    let session = state.store.get(id).await.unwrap();
    assert!(!session.is_active);
    assert_eq!(session.phase, SessionPhase::Ended);
    let (ended, _) = test_helpers::frame_with_syscall(&mut conn.rx, events::SESSION_ENDED).await;
    assert_eq!(ended.data["reason"], "manual");
}

#[tokio::test]
async fn second_end_is_rejected_as_inactive() {
    let state = test_helpers::test_app_state_with(
        None,
        crate::config::Settings { auto_reconnect: false, ..test_helpers::test_settings() },
    );
    let id = test_helpers::seed_session(&state).await;
    let mut conn = Conn::new();
    conn.join(&state, id).await;

    let first = conn.send(&state, &request_text("session:end", None, json!({}))).await;
    assert_eq!(first[0].status, Status::Done);
    let second = conn.send(&state, &request_text("session:end", None, json!({}))).await;
    assert_error(&second, Some("E_SESSION_INACTIVE"));
}

#[tokio::test]
async fn failed_join_keeps_previous_binding() {
    let state = test_helpers::test_app_state();
    let live = test_helpers::seed_session(&state).await;
    let ended = test_helpers::seed_session(&state).await;
    state.store.mark_ended(ended).await.unwrap();
    let mut conn = Conn::new();
    conn.join(&state, live).await;

    let frames = conn.send(&state, &request_text("session:join", Some(ended), json!({}))).await;
    assert_error(&frames, Some("E_SESSION_INACTIVE"));
    let frames = conn
        .send(&state, &request_text("session:join", Some(Uuid::new_v4()), json!({})))
        .await;
    assert_error(&frames, Some("E_SESSION_NOT_FOUND"));

    assert_eq!(conn.current, Some(live));
    assert_eq!(state.store.client_count(live).await, 1);
    let frames = conn
        .send(&state, &request_text("message:send", None, json!({ "text": "still here" })))
        .await;
    assert_eq!(frames[0].status, Status::Done);
}

#[tokio::test]
async fn in_session_requests_require_join() {
    let state = test_helpers::test_app_state();
    let mut conn = Conn::new();
    for (syscall, data) in [
        ("session:end", json!({})),
        ("session:extend", json!({ "decision": "extend" })),
        ("message:send", json!({ "text": "hi" })),
    ] {
        let frames = conn.send(&state, &request_text(syscall, None, data)).await;
        assert_error(&frames, None);
        assert_eq!(frames[0].data["message"], "must join a session first");
    }
}

#[tokio::test]
async fn request_for_other_session_is_rejected() {
    let state = test_helpers::test_app_state();
    let id = test_helpers::seed_session(&state).await;
    let mut conn = Conn::new();
    conn.join(&state, id).await;

    let other = Uuid::new_v4();
    let frames = conn.send(&state, &request_text("session:end", Some(other), json!({}))).await;
    assert_error(&frames, None);
    assert!(state.store.is_active(id).await);
}

// =============================================================================
// EXTENSION
// =============================================================================

#[tokio::test]
async fn extend_requires_valid_decision() {
    let state = test_helpers::test_app_state();
    let id = test_helpers::seed_session(&state).await;
    let mut conn = Conn::new();
    conn.join(&state, id).await;

    let frames = conn
        .send(&state, &request_text("session:extend", None, json!({ "decision": "maybe" })))
        .await;
    assert_error(&frames, None);
}

#[tokio::test]
async fn extend_before_offer_is_rejected() {
    let state = test_helpers::test_app_state();
    let id = test_helpers::seed_session(&state).await;
    let mut conn = Conn::new();
    conn.join(&state, id).await;

    let frames = conn
        .send(&state, &request_text("session:extend", None, json!({ "decision": "extend" })))
        .await;
    assert_error(&frames, Some("E_EXTENSION_NOT_OFFERED"));
}

#[tokio::test(start_paused = true)]
async fn extend_after_offer_replies_with_outcome() {
    let mock = Arc::new(MockLlm::texts(&["extend"]));
    let settings = crate::config::Settings {
        session_duration_secs: 5,
        extension_warning_secs: 3,
        auto_reconnect: false,
        ..test_helpers::test_settings()
    };
    let state = test_helpers::test_app_state_with(Some(mock as Arc<dyn LlmChat>), settings);
    let id = test_helpers::seed_session(&state).await;
    let mut conn = Conn::new();
    conn.join(&state, id).await;

    test_helpers::frame_with_syscall(&mut conn.rx, events::SESSION_EXTENSION_OFFER).await;
    let frames = conn
        .send(&state, &request_text("session:extend", None, json!({ "decision": "extend" })))
        .await;
    assert_eq!(frames[0].status, Status::Done);
    assert_eq!(frames[0].data["user_decision"], "extend");
    assert_eq!(frames[0].data["ai_decision"], "extend");
    assert_eq!(frames[0].data["both_extend"], true);

    let (event, _) = test_helpers::frame_with_syscall(&mut conn.rx, events::SESSION_EXTENSION).await;
    assert_eq!(event.data["success"], true);
}

// =============================================================================
// MESSAGES + TYPING
// =============================================================================

#[tokio::test]
async fn message_send_requires_text() {
    let state = test_helpers::test_app_state();
    let id = test_helpers::seed_session(&state).await;
    let mut conn = Conn::new();
    conn.join(&state, id).await;

    let frames = conn
        .send(&state, &request_text("message:send", None, json!({ "text": "   " })))
        .await;
    assert_error(&frames, None);
    assert!(state.store.get(id).await.unwrap().messages.is_empty());
}

#[tokio::test(start_paused = true)]
async fn message_send_stores_notifies_peers_and_gets_a_reply() {
    let mock = Arc::new(MockLlm::texts(&["Hey!\n\n*waves*"]));
    let state = test_helpers::test_app_state_with_llm(mock.clone() as Arc<dyn LlmChat>);
    let id = test_helpers::seed_session(&state).await;
    let mut conn = Conn::new();
    conn.join(&state, id).await;
    let (_, mut peer_rx) = test_helpers::attach_client(&state, id).await;

    let frames = conn
        .send(&state, &request_text("message:send", None, json!({ "text": "  Hi  " })))
        .await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Done);
    assert_eq!(frames[0].data["text"], "Hi");
    assert_eq!(frames[0].data["sender"], "user");

    let (peer_copy, _) = test_helpers::frame_with_syscall(&mut peer_rx, events::MESSAGE_NEW).await;
    assert_eq!(peer_copy.data["text"], "Hi");

    // The sender's channel sees only the persona's message.
    let (ai, _) = test_helpers::frame_with_syscall(&mut conn.rx, events::MESSAGE_NEW).await;
    assert_eq!(ai.data["sender"], "ai");
    assert_eq!(ai.data["text"], "Hey!");

    let session = state.store.get(id).await.unwrap();
    let texts: Vec<&str> = session.messages.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["Hi", "Hey!"]);
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test]
async fn typing_status_reaches_peers_only() {
    let state = test_helpers::test_app_state();
    let id = test_helpers::seed_session(&state).await;
    let mut conn = Conn::new();
    conn.join(&state, id).await;
    let (_, mut peer_rx) = test_helpers::attach_client(&state, id).await;

    let frames = conn
        .send(&state, &request_text("typing:status", None, json!({ "is_typing": true, "sender": "user" })))
        .await;
    assert!(frames.is_empty());

    let peer = timeout(Duration::from_millis(500), peer_rx.recv()).await.unwrap().unwrap();
    assert_eq!(peer.syscall, events::TYPING_UPDATE);
    assert_eq!(peer.data["is_typing"], true);
    assert_eq!(peer.data["sender"], "user");
    assert_no_frame(&mut conn.rx).await;
}

#[tokio::test]
async fn typing_after_end_is_rejected_and_not_relayed() {
    let state = test_helpers::test_app_state_with(
        None,
        crate::config::Settings { auto_reconnect: false, ..test_helpers::test_settings() },
    );
    let id = test_helpers::seed_session(&state).await;
    let mut conn = Conn::new();
    conn.join(&state, id).await;
    let (_, mut peer_rx) = test_helpers::attach_client(&state, id).await;

    conn.send(&state, &request_text("session:end", None, json!({}))).await;
    test_helpers::frame_with_syscall(&mut peer_rx, events::SESSION_ENDED).await;

    let frames = conn
        .send(&state, &request_text("typing:status", None, json!({ "is_typing": true })))
        .await;
    assert_error(&frames, Some("E_SESSION_INACTIVE"));
    assert_no_frame(&mut peer_rx).await;
}

#[tokio::test]
async fn typing_before_join_is_ignored() {
    let state = test_helpers::test_app_state();
    let mut conn = Conn::new();
    let frames = conn
        .send(&state, &request_text("typing:status", None, json!({ "is_typing": true })))
        .await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Done);
}

// =============================================================================
// ROLLOVER
// =============================================================================

#[test]
fn follow_rollover_tracks_new_session_id() {
    let client_id = Uuid::new_v4();
    let old = Uuid::new_v4();
    let new = Uuid::new_v4();
    let mut current = Some(old);

    follow_rollover(&mut current, client_id, &events::clock(new, 10));
    assert_eq!(current, Some(old));

    let joined = Frame::request(events::SESSION_JOINED, Data::new()).with_session_id(new);
    follow_rollover(&mut current, client_id, &joined);
    assert_eq!(current, Some(new));
}

// =============================================================================
// SOCKET
// =============================================================================

async fn next_text(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) -> Frame {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("socket receive timed out")
            .expect("socket closed")
            .expect("socket error");
        if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("frame json");
        }
    }
}

#[tokio::test]
async fn socket_connect_join_and_disconnect() {
    let state = test_helpers::test_app_state();
    let id = test_helpers::seed_session(&state).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = crate::routes::app(state.clone());
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws"))
        .await
        .unwrap();

    let welcome = next_text(&mut ws).await;
    assert_eq!(welcome.syscall, "session:connected");
    assert!(welcome.data["client_id"].as_str().is_some());

    let join = request_text("session:join", Some(id), json!({}));
    ws.send(tokio_tungstenite::tungstenite::Message::text(join))
        .await
        .unwrap();
    let reply = loop {
        let frame = next_text(&mut ws).await;
        if frame.syscall == "session:join" {
            break frame;
        }
    };
    assert_eq!(reply.status, Status::Done);
    assert_eq!(reply.data["session"]["persona"]["id"], state.store.get(id).await.unwrap().persona.id);
    assert_eq!(state.store.client_count(id).await, 1);

    ws.close(None).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while state.store.client_count(id).await > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.store.client_count(id).await, 0);
    assert!(state.store.is_active(id).await);

    server.abort();
}
