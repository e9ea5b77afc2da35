//! Header escaping per STOMP 1.1/1.2.
//!
//! | raw char  | escaped |
//! |-----------|---------|
//! | `\`       | `\\`    |
//! | LF        | `\n`    |
//! | CR        | `\r`    |
//! | `:`       | `\c`    |
//!
//! STOMP 1.0 performs no escaping. CONNECT, STOMP and CONNECTED frames are
//! exempt in every version; see [`frame_escapes`].

use std::borrow::Cow;

use crate::error::DecodeError;
use crate::version::Version;

/// Whether headers of a frame with this command are escaped under `version`.
pub fn frame_escapes(command: &str, version: Version) -> bool {
    version.escapes_headers() && !matches!(command, "CONNECT" | "STOMP" | "CONNECTED")
}

fn needs_escape(ch: char) -> bool {
    matches!(ch, '\\' | '\n' | '\r' | ':')
}

/// Escape a header key or value for transmission.
///
/// Single pass over the input, so an already-present backslash becomes `\\`
/// exactly once.
pub fn escape(input: &str, version: Version) -> Cow<'_, str> {
    if !version.escapes_headers() || !input.chars().any(needs_escape) {
        return Cow::Borrowed(input);
    }
    let mut out = String::with_capacity(input.len() + 8);
    for ch in input.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            _ => out.push(ch),
        }
    }
    Cow::Owned(out)
}

#[derive(Clone, Copy)]
enum EscapeState {
    Idle,
    SawBackslash,
}

/// Reverse [`escape`]. Any backslash followed by something other than
/// `\`, `c`, `n` or `r` (or a trailing lone backslash) is rejected.
pub fn unescape(token: &str, version: Version) -> Result<Cow<'_, str>, DecodeError> {
    if !version.escapes_headers() || !token.contains('\\') {
        return Ok(Cow::Borrowed(token));
    }
    let mut out = String::with_capacity(token.len());
    let mut state = EscapeState::Idle;
    for ch in token.chars() {
        state = match (state, ch) {
            (EscapeState::Idle, '\\') => EscapeState::SawBackslash,
            (EscapeState::Idle, c) => {
                out.push(c);
                EscapeState::Idle
            }
            (EscapeState::SawBackslash, c) => {
                out.push(match c {
                    '\\' => '\\',
                    'c' => ':',
                    'n' => '\n',
                    'r' => '\r',
                    other => return Err(DecodeError::InvalidEscape(format!("\\{}", other))),
                });
                EscapeState::Idle
            }
        };
    }
    match state {
        EscapeState::Idle => Ok(Cow::Owned(out)),
        EscapeState::SawBackslash => Err(DecodeError::InvalidEscape("\\".to_string())),
    }
}
