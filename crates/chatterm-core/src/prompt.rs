//! Prompt marker detection.
//!
//! The CLI prints a bright-green `>` when it is ready for input. Anything the
//! CLI printed after that marker in the same buffer is the assistant's reply.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

/// The marker exactly as the CLI emits it.
pub const PROMPT_MARKER: &str = "\x1b[38;5;10m>\x1b[0m";

/// Accepts `ESC[0m`, `ESC[m` and `ESC[39m` as the closing reset.
static PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[38;5;10m>\x1b\[(?:0|39)?m").expect("prompt regex is valid")
});

/// Result of scanning a buffer for the prompt marker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptDetection {
    /// Byte range of the first marker, if any.
    pub marker: Option<Range<usize>>,
    /// Everything after the marker, untrimmed. Empty without a marker.
    pub trailing_text: String,
}

impl PromptDetection {
    pub fn has_prompt(&self) -> bool {
        self.marker.is_some()
    }

    /// Byte offset where the marker starts.
    pub fn offset(&self) -> Option<usize> {
        self.marker.as_ref().map(|range| range.start)
    }
}

/// Finds the first prompt marker and returns the text following it.
pub fn detect_prompt(text: &str) -> PromptDetection {
    match PROMPT.find(text) {
        Some(m) => PromptDetection {
            marker: Some(m.range()),
            trailing_text: text[m.end()..].to_string(),
        },
        None => PromptDetection::default(),
    }
}

/// True when the marker is present and nothing but whitespace follows it.
pub fn is_waiting_for_input(text: &str) -> bool {
    let detection = detect_prompt(text);
    detection.has_prompt() && detection.trailing_text.trim().is_empty()
}

/// Removes the first marker. Later markers are left alone.
pub fn strip_prompt(text: &str) -> String {
    PROMPT.replace(text, "").into_owned()
}
