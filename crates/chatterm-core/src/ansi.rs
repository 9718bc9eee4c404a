//! Escape-sequence and decoration stripping.
//!
//! Terminal AI CLIs paint their output with colors, cursor movement, window
//! titles and animated glyphs. [`strip_escape_sequences`] reduces a fragment of
//! that output to the text a chat client should display. It does not emulate a
//! terminal: cursor movement is dropped, not applied.
//!
//! 7-bit escape sequences are parsed by `strip-ansi-escapes`; the regexes here
//! only cover what that crate leaves alone.

use regex::Regex;
use std::sync::LazyLock;

/// 8-bit CSI (`0x9B params final`) and OSC (`0x9D ... ST|BEL`) introducers.
static C1_SEQUENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x{9b}[0-?]*[ -/]*[@-~]|\x{9d}[^\x07\x{9c}]*(?:\x07|\x{9c})")
        .expect("C1 sequence regex is valid")
});

/// One or more "thinking..." tokens, possibly repeated by spinner redraws.
static THINKING_RUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)thinking(?:\.\.\.|…)(?:\s*thinking(?:\.\.\.|…))*")
        .expect("thinking regex is valid")
});

static HORIZONTAL_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" {2,}").expect("space regex is valid"));

static SPACE_BEFORE_NEWLINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" +\n").expect("newline regex is valid"));

static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("paragraph regex is valid"));

/// Canonical form of a collapsed thinking run.
pub const THINKING_TOKEN: &str = "Thinking...";

/// Strips escape sequences, control characters and decorative glyphs.
///
/// - CSI, OSC, charset and other escape sequences are removed, including a
///   truncated sequence at the end of the fragment.
/// - C0 controls other than `\n` and all C1 controls are removed. Tabs become
///   spaces.
/// - Braille spinners, block/progress elements and suit/note symbols are removed.
/// - `\r\n` and `\r` become `\n`.
/// - Repeated `thinking...` tokens collapse into one [`THINKING_TOKEN`].
/// - Runs of spaces/tabs become one space, spaces before a newline are dropped,
///   and three or more newlines become a paragraph break.
///
/// The result is stable: stripping it again returns it unchanged.
///
/// # Examples
///
/// ```
/// use chatterm_core::strip_escape_sequences;
///
/// let raw = "\x1b[1;36m⠋ Thinking... ⠙ thinking...\x1b[0m\r\nDone\x1b[?25h";
/// assert_eq!(strip_escape_sequences(raw), " Thinking...\nDone");
/// ```
pub fn strip_escape_sequences(text: &str) -> String {
    let text = C1_SEQUENCE.replace_all(text, "");
    let text: String = text.chars().filter(|c| !is_c1_control(*c)).collect();
    let text = text
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\t', " ");

    // Only printable characters and line feeds survive this.
    let text = String::from_utf8_lossy(&strip_ansi_escapes::strip(text.as_bytes())).into_owned();

    let text: String = text.chars().filter(|c| !is_decorative_glyph(*c)).collect();

    let text = THINKING_RUN.replace_all(&text, THINKING_TOKEN);
    let text = HORIZONTAL_SPACE.replace_all(&text, " ");
    let text = SPACE_BEFORE_NEWLINE.replace_all(&text, "\n");
    PARAGRAPH_BREAK.replace_all(&text, "\n\n").into_owned()
}

fn is_c1_control(c: char) -> bool {
    ('\u{80}'..='\u{9f}').contains(&c)
}

fn is_decorative_glyph(c: char) -> bool {
    matches!(
        c,
        '\u{2800}'..='\u{28ff}' // braille spinners
            | '\u{2580}'..='\u{259f}' // block and progress-bar elements
            | '\u{25a0}'..='\u{25a1}' // ■ □
            | '\u{25aa}'..='\u{25ab}' // ▪ ▫
            | '\u{2660}'..='\u{266f}' // suits and notes
    )
}
