use super::*;
use crate::llm::types::Role;

fn make_response(content: serde_json::Value) -> String {
    serde_json::json!({
        "id": "msg_123",
        "type": "message",
        "role": "assistant",
        "content": content,
        "model": "claude-sonnet-4-5-20250929",
        "stop_reason": "end_turn",
        "usage": { "input_tokens": 100, "output_tokens": 50 }
    })
    .to_string()
}

#[test]
fn parse_text_response() {
    let json = make_response(serde_json::json!([
        { "type": "text", "text": "Hey!\n\n*waves*" }
    ]));
    let resp = parse_response(&json).unwrap();
    assert_eq!(resp.content.len(), 1);
    assert_eq!(resp.text().as_deref(), Some("Hey!\n\n*waves*"));
    assert_eq!(resp.model, "claude-sonnet-4-5-20250929");
    assert_eq!(resp.stop_reason, "end_turn");
    assert_eq!(resp.input_tokens, 100);
    assert_eq!(resp.output_tokens, 50);
}

#[test]
fn parse_unknown_content_filtered() {
    let json = make_response(serde_json::json!([
        { "type": "text", "text": "hi" },
        { "type": "some_future_type", "data": {} }
    ]));
    let resp = parse_response(&json).unwrap();
    assert_eq!(resp.content.len(), 1);
}

#[test]
fn parse_missing_stop_reason_defaults() {
    let json = serde_json::json!({
        "content": [{ "type": "text", "text": "yes" }],
        "model": "m",
        "usage": { "input_tokens": 1, "output_tokens": 1 }
    })
    .to_string();
    let resp = parse_response(&json).unwrap();
    assert_eq!(resp.stop_reason, "end_turn");
}

#[test]
fn parse_invalid_json_is_api_parse_error() {
    let err = parse_response("not json").unwrap_err();
    assert!(matches!(err, LlmError::ApiParse(_)));
}

#[test]
fn request_omits_empty_system() {
    let messages = [Message::user("hi")];
    let body = ApiRequest { model: "m", max_tokens: 10, temperature: 0.5, system: "", messages: &messages };
    let json = serde_json::to_value(&body).unwrap();
    assert!(json.get("system").is_none());
    assert_eq!(json["messages"][0]["role"], serde_json::json!(Role::User));
    assert_eq!(json["max_tokens"], 10);
}
