use super::*;
use crate::persona::{PersonaStore, StaticPersonaStore};

fn session_with(messages: &[(Speaker, &str)]) -> Session {
    let mut session = Session::new(StaticPersonaStore::builtin().get("mira").unwrap(), 600);
    session.messages = messages
        .iter()
        .map(|(sender, text)| ChatMessage::new(*sender, *text))
        .collect();
    session
}

#[test]
fn estimate_rounds_up() {
    assert_eq!(estimate_tokens(""), 0);
    assert_eq!(estimate_tokens("abc"), 1);
    assert_eq!(estimate_tokens("abcd"), 1);
    assert_eq!(estimate_tokens("abcde"), 2);
}

#[test]
fn system_instruction_includes_persona_and_style() {
    let persona = StaticPersonaStore::builtin().get("mira").unwrap();
    let system = system_instruction(&persona);
    assert!(system.starts_with("You are Mira."));
    assert!(system.contains(&persona.personality));
    assert!(system.contains("Background:"));
    assert!(system.ends_with(STYLE_NOTE));
}

#[test]
fn persona_without_description_has_no_background() {
    let mut persona = StaticPersonaStore::builtin().get("theo").unwrap();
    persona.description = Some("   ".into());
    assert!(!persona_instruction(&persona).contains("Background"));
}

#[test]
fn history_keeps_most_recent_window() {
    let session = session_with(&[(Speaker::User, "a"), (Speaker::Ai, "b"), (Speaker::User, "c")]);
    let window = history(&session.messages, 2);
    assert_eq!(window, vec![Message::assistant("b"), Message::user("c")]);
    assert_eq!(history(&session.messages, 10).len(), 3);
    assert!(history(&session.messages, 0).is_empty());
}

#[test]
fn prompt_block_has_named_segments_in_order() {
    let session = session_with(&[(Speaker::User, "Hi"), (Speaker::Ai, "Hey!")]);
    let block = prompt_block(&session, 20);
    let names: Vec<&str> = block.segments.iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["system", "history", "style"]);
    assert_eq!(block.segments[1].text, "user: Hi\nMira: Hey!");
    assert_eq!(block.estimated_tokens, block.segments.iter().map(|s| s.estimated_tokens).sum::<usize>());
}

#[test]
fn prompt_block_does_not_mutate_session() {
    let session = session_with(&[(Speaker::User, "Hi")]);
    let before = serde_json::to_value(&session).unwrap();
    let _ = prompt_block(&session, 20);
    assert_eq!(serde_json::to_value(&session).unwrap(), before);
}
