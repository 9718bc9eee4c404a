//! Per-session composition of the stream handler and the chat state machine.
//!
//! [`StreamHandler`] reports what the terminal showed; [`ChatStateManager`]
//! enforces a legal turn cycle. The CLI sometimes skips phases (a reply with no
//! spinner, a prompt right after thinking), so the session walks the cycle
//! forward through the missing legal steps instead of rejecting the event.

use std::time::Duration;

use chatterm_proto::ChatEvent;
use tracing::{debug, info, warn};

use crate::ansi::strip_escape_sequences;
use crate::chat_state::{ChatState, ChatStateManager};
use crate::stream_handler::{StreamHandler, StreamState};

#[derive(Debug)]
pub struct ChatSession {
    session_id: String,
    handler: StreamHandler,
    chat: ChatStateManager,
}

impl ChatSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            handler: StreamHandler::new(),
            chat: ChatStateManager::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn chat_state(&self) -> ChatState {
        self.chat.state()
    }

    pub fn stream_state(&self) -> StreamState {
        self.handler.state()
    }

    pub fn last_thinking_duration(&self) -> Option<Duration> {
        self.chat.thinking_duration()
    }

    /// Parses one chunk and returns the cleaned events, in order.
    ///
    /// `ChatMessage` and `Output` content is passed through
    /// [`strip_escape_sequences`]. Output that is blank afterwards is dropped,
    /// and a message that is blank afterwards is reported as `PromptReady`.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ChatEvent> {
        self.handler
            .feed(chunk)
            .into_iter()
            .filter_map(|event| self.apply(event))
            .collect()
    }

    /// Releases a trailing partial line, e.g. at process EOF.
    pub fn flush(&mut self) -> Option<ChatEvent> {
        self.handler.flush().and_then(|event| self.apply(event))
    }

    /// Resets both machines together when the child process is replaced.
    pub fn on_process_restart(&mut self) {
        info!(session_id = %self.session_id, "Process restarted, resetting chat state");
        self.handler.reset();
        self.chat.reset();
    }

    fn apply(&mut self, event: ChatEvent) -> Option<ChatEvent> {
        match event {
            ChatEvent::ThinkingStart { .. } => {
                self.advance_to(ChatState::Thinking);
                Some(event)
            }
            ChatEvent::ThinkingUpdate { .. } => Some(event),
            ChatEvent::ThinkingEnd { .. } => {
                self.advance_to(ChatState::Responding);
                Some(event)
            }
            ChatEvent::ChatMessage { content, timestamp } => {
                let content = strip_escape_sequences(&content).trim().to_string();
                self.advance_to(ChatState::Responding);
                self.advance_to(ChatState::Idle);
                if content.is_empty() {
                    Some(ChatEvent::PromptReady { timestamp })
                } else {
                    Some(ChatEvent::ChatMessage { content, timestamp })
                }
            }
            ChatEvent::PromptReady { .. } => {
                self.advance_to(ChatState::Idle);
                Some(event)
            }
            ChatEvent::Output { content, timestamp } => {
                let content = strip_escape_sequences(&content);
                if content.trim().is_empty() {
                    None
                } else {
                    Some(ChatEvent::Output { content, timestamp })
                }
            }
        }
    }

    /// Steps the turn cycle forward until `target` is reached.
    fn advance_to(&mut self, target: ChatState) {
        while self.chat.state() != target {
            let from = self.chat.state();
            let step = match from {
                ChatState::Idle => self.chat.start_thinking(),
                ChatState::Thinking => self.chat.start_responding(),
                ChatState::Responding => self.chat.complete_response(),
            };
            if let Err(e) = step {
                warn!(session_id = %self.session_id, error = %e, "Chat state out of step, resetting");
                self.chat.reset();
                return;
            }
            debug!(session_id = %self.session_id, %from, to = %self.chat.state(), "Chat state advanced");
        }
    }
}
