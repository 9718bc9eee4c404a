//! End-to-end parsing scenarios over realistic CLI output.

use chatterm_core::{ChatSession, ChatState, PROMPT_MARKER, StreamHandler, StreamState};
use chatterm_proto::ChatEvent;

fn kinds(events: &[ChatEvent]) -> Vec<&'static str> {
    events.iter().map(ChatEvent::kind).collect()
}

#[test]
fn lines_then_prompt_with_response() {
    let mut handler = StreamHandler::new();

    let first = handler.feed(b"Line 1\nLine 2\n");
    let second = handler.feed(format!("{PROMPT_MARKER} Response").as_bytes());

    assert!(matches!(
        first.as_slice(),
        [ChatEvent::Output { content, .. }] if content == "Line 1\nLine 2\n"
    ));
    assert!(matches!(
        second.as_slice(),
        [ChatEvent::ChatMessage { content, .. }] if content == "Response"
    ));
}

#[test]
fn spinner_animation_then_answer() {
    let mut handler = StreamHandler::new();
    let mut events = Vec::new();

    for chunk in [
        "\r⠋ Thinking...",
        "\r⠙ Thinking...",
        "\r⠹ Thinking...",
    ] {
        events.extend(handler.feed(chunk.as_bytes()));
    }
    events.extend(handler.feed(format!("{PROMPT_MARKER} The answer is 42").as_bytes()));

    assert_eq!(
        kinds(&events),
        [
            "thinking_start",
            "thinking_update",
            "thinking_update",
            "thinking_update",
            "thinking_end",
            "chat_message",
        ]
    );
    let spinners: Vec<char> = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::ThinkingUpdate { spinner, .. } => Some(*spinner),
            _ => None,
        })
        .collect();
    assert_eq!(spinners, ['⠋', '⠙', '⠹']);
    assert_eq!(handler.state(), StreamState::Idle);
}

#[test]
fn idle_prompt_yields_only_prompt_ready() {
    let mut handler = StreamHandler::new();
    let events = handler.feed(format!("{PROMPT_MARKER} \t \r\n").as_bytes());
    assert_eq!(kinds(&events), ["prompt_ready"]);
}

#[test]
fn timestamps_are_monotonic() {
    let mut handler = StreamHandler::new();
    let mut events = handler.feed("\r⠋ Thinking...".as_bytes());
    events.extend(handler.feed(format!("{PROMPT_MARKER} done").as_bytes()));

    for pair in events.windows(2) {
        assert!(pair[0].timestamp() <= pair[1].timestamp());
    }
}

#[test]
fn session_survives_restart_mid_turn() {
    let mut session = ChatSession::new("restart");

    session.feed("\r⠋ Thinking...".as_bytes());
    assert_eq!(session.chat_state(), ChatState::Thinking);

    session.on_process_restart();
    let events = session.feed(b"\x1b[2J\x1b[HWelcome back\n");
    assert!(matches!(
        events.as_slice(),
        [ChatEvent::Output { content, .. }] if content == "Welcome back\n"
    ));

    let events = session.feed(format!("\r⠦ Thinking...{PROMPT_MARKER} hi").as_bytes());
    assert_eq!(
        kinds(&events),
        ["thinking_start", "thinking_update", "thinking_end", "chat_message"]
    );
    assert_eq!(session.chat_state(), ChatState::Idle);
}

#[test]
fn byte_at_a_time_delivery() {
    let mut handler = StreamHandler::new();
    let mut events = Vec::new();

    for text in ["héllo wörld\n", "\r⠋ Thinking..."] {
        for byte in text.as_bytes() {
            events.extend(handler.feed(std::slice::from_ref(byte)));
        }
    }
    events.extend(handler.feed(format!("{PROMPT_MARKER} ✓ fertig").as_bytes()));

    assert_eq!(
        kinds(&events),
        ["output", "thinking_start", "thinking_update", "thinking_end", "chat_message"]
    );
    assert!(matches!(
        &events[0],
        ChatEvent::Output { content, .. } if content == "héllo wörld\n"
    ));
    assert!(matches!(
        events.last(),
        Some(ChatEvent::ChatMessage { content, .. }) if content == "✓ fertig"
    ));
}
