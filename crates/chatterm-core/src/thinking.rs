//! Thinking spinner detection.
//!
//! While the model works, the CLI redraws `\r<glyph> Thinking...` in place,
//! cycling the braille glyph. Each redraw is one match.

use std::sync::LazyLock;

use regex::Regex;

/// Spinner frames, in the order the CLI cycles them.
pub const SPINNER_GLYPHS: [char; 10] = ['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

static THINKING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\r([⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]) Thinking\.\.\.").expect("thinking regex is valid")
});

/// Outcome of one [`ThinkingDetector::detect`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThinkingDetection {
    pub is_thinking: bool,
    /// Glyph of the last redraw in the scanned text.
    pub spinner: Option<char>,
}

/// Tracks whether the most recently scanned text showed the spinner.
///
/// State is recomputed on every call: a call without a match clears it.
#[derive(Debug, Clone, Default)]
pub struct ThinkingDetector {
    in_progress: bool,
    last_spinner: Option<char>,
}

impl ThinkingDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detect(&mut self, text: &str) -> ThinkingDetection {
        let spinner = THINKING
            .captures_iter(text)
            .last()
            .and_then(|caps| caps.get(1))
            .and_then(|glyph| glyph.as_str().chars().next());

        self.in_progress = spinner.is_some();
        self.last_spinner = spinner;

        ThinkingDetection {
            is_thinking: self.in_progress,
            spinner,
        }
    }

    pub fn is_thinking_in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn last_spinner(&self) -> Option<char> {
        self.last_spinner
    }

    pub fn reset(&mut self) {
        self.in_progress = false;
        self.last_spinner = None;
    }
}

/// Removes every spinner redraw from `text`.
pub fn strip_thinking_pattern(text: &str) -> String {
    THINKING.replace_all(text, "").into_owned()
}
