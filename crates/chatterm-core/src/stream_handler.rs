//! Chunk-driven parser turning raw CLI output into [`ChatEvent`]s.
//!
//! The handler keeps a rolling text buffer. Each chunk is appended and the
//! buffer is scanned for spinner redraws first and the prompt marker second:
//!
//! - spinner redraws produce `ThinkingStart` (once per thinking phase) and
//!   `ThinkingUpdate`, and are removed from the buffer;
//! - the prompt marker closes the turn: `ThinkingEnd` if a thinking phase was
//!   open, then the text after the marker as `ChatMessage` (or `PromptReady`
//!   when there is none), and the buffer is cleared;
//! - otherwise complete lines are released as `Output`.
//!
//! Content is emitted raw. Escape stripping is the consumer's call (see
//! [`crate::ChatSession`]).

use chatterm_proto::ChatEvent;
use chrono::Utc;
use tracing::debug;

use crate::prompt::detect_prompt;
use crate::thinking::{ThinkingDetector, strip_thinking_pattern};

/// Buffered text beyond this is released as `Output` even without a newline.
pub const MAX_BUFFER_BYTES: usize = 64 * 1024;

/// A released oversized buffer keeps a tail this short when it starts at an
/// escape or carriage return, since it may be the start of a prompt marker or
/// spinner redraw. Both patterns are under 20 bytes.
const MARKER_HOLDBACK_BYTES: usize = 32;

/// Parser state as seen by the stream handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamState {
    #[default]
    Idle,
    Thinking,
    /// Never entered here; responding is tracked by the chat state manager.
    Responding,
}

#[derive(Debug, Default)]
pub struct StreamHandler {
    state: StreamState,
    buffer: String,
    /// Trailing bytes of an incomplete UTF-8 sequence from the last chunk.
    pending: Vec<u8>,
    detector: ThinkingDetector,
}

impl StreamHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Text received but not yet emitted.
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// Processes one chunk of raw output and returns the events it completes,
    /// in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ChatEvent> {
        let text = self.decode(chunk);
        self.buffer.push_str(&text);

        let timestamp = Utc::now();
        let mut events = Vec::new();

        let thinking = self.detector.detect(&self.buffer);
        if let Some(spinner) = thinking.spinner {
            if self.state != StreamState::Thinking {
                debug!(%spinner, "Thinking started");
                self.state = StreamState::Thinking;
                events.push(ChatEvent::ThinkingStart { spinner, timestamp });
            }
            events.push(ChatEvent::ThinkingUpdate { spinner, timestamp });
            self.buffer = strip_thinking_pattern(&self.buffer);
        }

        let prompt = detect_prompt(&self.buffer);
        if prompt.has_prompt() {
            if self.state == StreamState::Thinking {
                debug!("Thinking ended at prompt");
                self.state = StreamState::Idle;
                events.push(ChatEvent::ThinkingEnd { timestamp });
            }

            let content = prompt.trailing_text.trim();
            if content.is_empty() {
                debug!("Prompt ready");
                events.push(ChatEvent::PromptReady { timestamp });
            } else {
                debug!(len = content.len(), "Chat message after prompt");
                events.push(ChatEvent::ChatMessage {
                    content: content.to_string(),
                    timestamp,
                });
            }

            self.buffer.clear();
            return events;
        }

        if !thinking.is_thinking
            && let Some(last_newline) = self.buffer.rfind('\n')
        {
            let rest = self.buffer.split_off(last_newline + 1);
            let content = std::mem::replace(&mut self.buffer, rest);
            if !content.trim().is_empty() {
                events.push(ChatEvent::Output { content, timestamp });
            }
        }

        if self.buffer.len() > MAX_BUFFER_BYTES {
            debug!(len = self.buffer.len(), "Releasing oversized buffer");
            let keep_from = self
                .buffer
                .rfind(|c: char| c == '\x1b' || c == '\r')
                .filter(|&at| self.buffer.len() - at <= MARKER_HOLDBACK_BYTES)
                .unwrap_or(self.buffer.len());
            let tail = self.buffer.split_off(keep_from);
            let content = std::mem::replace(&mut self.buffer, tail);
            events.push(ChatEvent::Output { content, timestamp });
        }

        events
    }

    /// Releases whatever is still buffered as `Output`.
    ///
    /// Used when the process reaches EOF so a last partial line is not lost.
    pub fn flush(&mut self) -> Option<ChatEvent> {
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.buffer.push_str(&tail);
            self.pending.clear();
        }

        let content = std::mem::take(&mut self.buffer);
        if content.trim().is_empty() {
            return None;
        }
        Some(ChatEvent::Output {
            content,
            timestamp: Utc::now(),
        })
    }

    /// Returns to `Idle` with an empty buffer and a fresh thinking detector.
    pub fn reset(&mut self) {
        self.state = StreamState::Idle;
        self.buffer.clear();
        self.pending.clear();
        self.detector.reset();
    }

    /// Decodes `chunk` after any held-back bytes. Invalid sequences become
    /// U+FFFD; an incomplete sequence at the end is held back.
    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::PROMPT_MARKER;

    fn kinds(events: &[ChatEvent]) -> Vec<&'static str> {
        events.iter().map(ChatEvent::kind).collect()
    }

    #[test]
    fn test_releases_complete_lines_as_output() {
        let mut handler = StreamHandler::new();
        let events = handler.feed(b"Line 1\nLine 2\npartial");

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ChatEvent::Output { content, .. } if content == "Line 1\nLine 2\n"
        ));
        assert_eq!(handler.buffered(), "partial");
    }

    #[test]
    fn test_no_output_without_newline() {
        let mut handler = StreamHandler::new();
        assert!(handler.feed(b"no newline yet").is_empty());
        assert_eq!(handler.buffered(), "no newline yet");
    }

    #[test]
    fn test_blank_lines_are_not_emitted() {
        let mut handler = StreamHandler::new();
        assert!(handler.feed(b"  \n\n").is_empty());
        assert_eq!(handler.buffered(), "");
    }

    #[test]
    fn test_thinking_start_emitted_once_per_phase() {
        let mut handler = StreamHandler::new();

        let first = handler.feed("\r⠋ Thinking...".as_bytes());
        assert_eq!(kinds(&first), ["thinking_start", "thinking_update"]);
        assert_eq!(handler.state(), StreamState::Thinking);

        let second = handler.feed("\r⠙ Thinking...".as_bytes());
        assert_eq!(kinds(&second), ["thinking_update"]);
        assert!(matches!(second[0], ChatEvent::ThinkingUpdate { spinner: '⠙', .. }));
        assert_eq!(handler.buffered(), "");
    }

    #[test]
    fn test_prompt_closes_thinking_with_message() {
        let mut handler = StreamHandler::new();
        handler.feed("\r⠋ Thinking...".as_bytes());

        let events = handler.feed(format!("{PROMPT_MARKER} Here is the answer\n").as_bytes());
        assert_eq!(kinds(&events), ["thinking_end", "chat_message"]);
        assert!(matches!(
            &events[1],
            ChatEvent::ChatMessage { content, .. } if content == "Here is the answer"
        ));
        assert_eq!(handler.state(), StreamState::Idle);
        assert_eq!(handler.buffered(), "");
    }

    #[test]
    fn test_whitespace_after_prompt_is_prompt_ready() {
        let mut handler = StreamHandler::new();
        let events = handler.feed(format!("{PROMPT_MARKER}   \n").as_bytes());
        assert_eq!(kinds(&events), ["prompt_ready"]);
    }

    #[test]
    fn test_spinner_and_prompt_in_one_chunk() {
        let mut handler = StreamHandler::new();
        let events = handler.feed(format!("\r⠸ Thinking...{PROMPT_MARKER} Done").as_bytes());
        assert_eq!(
            kinds(&events),
            ["thinking_start", "thinking_update", "thinking_end", "chat_message"]
        );
    }

    #[test]
    fn test_spinner_split_across_chunks() {
        let mut handler = StreamHandler::new();
        assert!(handler.feed("\r⠋ Think".as_bytes()).is_empty());
        let events = handler.feed(b"ing...");
        assert_eq!(kinds(&events), ["thinking_start", "thinking_update"]);
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let mut handler = StreamHandler::new();
        let bytes = "héllo\n".as_bytes();
        // 'é' is two bytes; cut between them.
        assert!(handler.feed(&bytes[..2]).is_empty());
        let events = handler.feed(&bytes[2..]);
        assert!(matches!(
            &events[0],
            ChatEvent::Output { content, .. } if content == "héllo\n"
        ));
    }

    #[test]
    fn test_invalid_bytes_become_replacement_character() {
        let mut handler = StreamHandler::new();
        let events = handler.feed(b"bad \xff byte\n");
        assert!(matches!(
            &events[0],
            ChatEvent::Output { content, .. } if content == "bad \u{fffd} byte\n"
        ));
    }

    #[test]
    fn test_oversized_buffer_is_released() {
        let mut handler = StreamHandler::new();
        let chunk = vec![b'x'; MAX_BUFFER_BYTES + 1];
        let events = handler.feed(&chunk);
        assert_eq!(kinds(&events), ["output"]);
        assert_eq!(handler.buffered(), "");
    }

    #[test]
    fn test_prompt_marker_straddling_the_cap_survives() {
        let mut handler = StreamHandler::new();
        let mut chunk = vec![b'x'; MAX_BUFFER_BYTES];
        chunk.extend_from_slice(b"\x1b[38;5;10m");

        let events = handler.feed(&chunk);
        assert!(matches!(
            &events[..],
            [ChatEvent::Output { content, .. }] if content.len() == MAX_BUFFER_BYTES
        ));
        assert_eq!(handler.buffered(), "\x1b[38;5;10m");

        let events = handler.feed(b">\x1b[0m Response");
        assert!(matches!(
            &events[..],
            [ChatEvent::ChatMessage { content, .. }] if content == "Response"
        ));
    }

    #[test]
    fn test_spinner_straddling_the_cap_survives() {
        let mut handler = StreamHandler::new();
        let mut chunk = vec![b'x'; MAX_BUFFER_BYTES];
        chunk.extend_from_slice("\r⠋ Think".as_bytes());

        assert_eq!(kinds(&handler.feed(&chunk)), ["output"]);
        let events = handler.feed(b"ing...");
        assert_eq!(kinds(&events), ["thinking_start", "thinking_update"]);
    }

    #[test]
    fn test_oversized_buffer_with_distant_escape_is_released_whole() {
        let mut handler = StreamHandler::new();
        let mut chunk = b"\x1b[1m".to_vec();
        chunk.extend(vec![b'x'; MAX_BUFFER_BYTES]);

        assert_eq!(kinds(&handler.feed(&chunk)), ["output"]);
        assert_eq!(handler.buffered(), "");
    }

    #[test]
    fn test_flush_releases_partial_line() {
        let mut handler = StreamHandler::new();
        handler.feed(b"tail without newline");
        let event = handler.flush();
        assert!(matches!(
            event,
            Some(ChatEvent::Output { ref content, .. }) if content == "tail without newline"
        ));
        assert!(handler.flush().is_none());
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let mut handler = StreamHandler::new();
        handler.feed("\r⠋ Thinking...pending".as_bytes());
        handler.feed(&[0xe2, 0x80]);
        handler.reset();

        assert_eq!(handler.state(), StreamState::Idle);
        assert_eq!(handler.buffered(), "");
        assert!(handler.flush().is_none());

        let events = handler.feed("\r⠙ Thinking...".as_bytes());
        assert_eq!(kinds(&events), ["thinking_start", "thinking_update"]);
    }
}
