//! Logging and text helpers for relayed content.
//!
//! Mesh and chat messages are user supplied and may contain newlines or control characters;
//! `escape_log` keeps every log record on one line. `truncate_utf8` trims outbound mesh text
//! to the radio payload limit without splitting a character.

use std::fmt::Write;

/// Longest preview emitted into a log line, in characters.
const MAX_PREVIEW: usize = 300;

/// Escape a string for single-line logging.
///
/// `\n`, `\r`, `\t` and backslash are escaped, other control characters become `\xNN`,
/// and anything past [`MAX_PREVIEW`] characters is replaced by an ellipsis.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Truncate `s` to at most `max_bytes` bytes, backing off to the previous char boundary.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
