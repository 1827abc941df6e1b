//! Logging helpers that keep payloads and key material out of log output.
//!
//! Link and Session code log message sizes and short previews only. The full
//! body of a chat message never goes through `tracing`.

use std::fmt;

/// A wrapper that redacts sensitive data when displayed.
pub struct Redacted<T>(pub T);

impl<T: fmt::Display> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: fmt::Debug> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Redact a byte slice, showing only length.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl<'a> fmt::Display for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl<'a> fmt::Debug for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Show the first and last 4 bytes of a binary blob as hex.
pub struct ShortHex<'a>(pub &'a [u8]);

impl<'a> fmt::Display for ShortHex<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        if b.len() > 8 {
            write!(
                f,
                "{}..{}",
                hex::encode(&b[..4]),
                hex::encode(&b[b.len() - 4..])
            )
        } else {
            write!(f, "{}", hex::encode(b))
        }
    }
}

/// Longest preview emitted by [`preview`], in characters.
pub const PREVIEW_CHARS: usize = 16;

/// Shorten a message body for debug logs.
pub fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
