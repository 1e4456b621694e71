use super::*;

#[test]
fn cc_parse_text_response() {
    let json = serde_json::json!({
        "model": "gpt-4o-mini",
        "choices": [{ "finish_reason": "stop", "message": { "role": "assistant", "content": "hey there" } }],
        "usage": { "prompt_tokens": 12, "completion_tokens": 3 }
    })
    .to_string();
    let resp = parse_chat_completions_response(&json).unwrap();
    assert_eq!(resp.text().as_deref(), Some("hey there"));
    assert_eq!(resp.model, "gpt-4o-mini");
    assert_eq!(resp.stop_reason, "end_turn");
    assert_eq!(resp.input_tokens, 12);
    assert_eq!(resp.output_tokens, 3);
}

#[test]
fn cc_parse_length_stop() {
    let json = serde_json::json!({
        "choices": [{ "finish_reason": "length", "message": { "content": "cut o" } }]
    })
    .to_string();
    let resp = parse_chat_completions_response(&json).unwrap();
    assert_eq!(resp.stop_reason, "max_tokens");
    assert_eq!(resp.input_tokens, 0);
}

#[test]
fn cc_parse_null_content_has_no_text() {
    let json = serde_json::json!({
        "choices": [{ "message": { "content": null, "reasoning_content": "pondering" } }]
    })
    .to_string();
    let resp = parse_chat_completions_response(&json).unwrap();
    assert!(resp.text().is_none());
    assert!(matches!(&resp.content[0], ContentBlock::Thinking { thinking } if thinking == "pondering"));
}

#[test]
fn cc_parse_missing_choices() {
    let err = parse_chat_completions_response(r#"{"model":"x"}"#).unwrap_err();
    assert!(matches!(err, LlmError::ApiParse(msg) if msg.contains("choices")));
}

#[test]
fn build_messages_prepends_system() {
    let history = [Message::user("hi"), Message::assistant("hey")];
    let msgs = build_messages("be nice", &history);
    assert_eq!(msgs.len(), 3);
    assert_eq!(msgs[0].role, "system");
    assert_eq!(msgs[1].role, "user");
    assert_eq!(msgs[2].content, "hey");
}

#[test]
fn build_messages_skips_blank_system() {
    let history = [Message::user("hi")];
    let msgs = build_messages("   ", &history);
    assert_eq!(msgs.len(), 1);
}
