//! Resumable STOMP frame decoder.
//!
//! `FrameDecoder` accepts byte chunks in arrival order and yields frames and
//! heartbeats as soon as they are complete. Chunk boundaries may fall
//! anywhere: the decoder remembers which part of the frame it is in (command
//! line, header block, body, trailing EOL) and how far it already scanned, so
//! partial input is never re-parsed from the start.

use bytes::{Buf, BytesMut};
use std::mem;

use crate::codec::StompItem;
use crate::error::DecodeError;
use crate::frame::Frame;
use crate::header::{frame_escapes, unescape};
use crate::version::Version;

/// Default upper bound on a single frame (command + headers + body).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Between frames: NUL or bare EOL is a heartbeat, anything else starts
    /// a command line.
    Command,
    Headers,
    Body { content_length: Option<usize> },
    /// Right after a frame's NUL: one optional EOL is padding, not a heartbeat.
    Trailer,
}

#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    stage: Stage,
    /// Bytes at the front of `buf` already searched for the current delimiter.
    scanned: usize,
    /// Bytes of the in-progress frame already consumed from `buf`.
    consumed: usize,
    command: String,
    headers: Vec<(String, String)>,
    version: Version,
    max_frame_size: usize,
}

enum Line {
    Command,
    Header,
}

impl FrameDecoder {
    /// A decoder using STOMP 1.0 header rules (no unescaping) until
    /// [`set_version`](Self::set_version) is called.
    pub fn new() -> Self {
        Self::with_version(Version::V1_0)
    }

    pub fn with_version(version: Version) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            stage: Stage::Command,
            scanned: 0,
            consumed: 0,
            command: String::new(),
            headers: Vec::new(),
            version,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn max_frame_size(mut self, limit: usize) -> Self {
        self.max_frame_size = limit;
        self
    }

    /// Switch header unescaping to the negotiated protocol version.
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Bytes received but not yet turned into an item.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// True when no partial frame or partial heartbeat is held. Parsed
    /// command and header lines are not counted by [`buffered`](Self::buffered),
    /// so this is the check for a stream that may end here.
    pub fn is_between_frames(&self) -> bool {
        matches!(self.stage, Stage::Command | Stage::Trailer) && self.buf.is_empty()
    }

    /// Append a chunk without decoding it yet; pair with [`next_item`](Self::next_item).
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Append `chunk` and decode every item it completes.
    ///
    /// An error is terminal: the stream is considered corrupt and the caller
    /// is expected to close the connection.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<StompItem>, DecodeError> {
        self.push(chunk);
        let mut items = Vec::new();
        while let Some(item) = self.next_item()? {
            items.push(item);
        }
        Ok(items)
    }

    /// Decode the next complete item from buffered bytes, or `Ok(None)` when
    /// more input is needed.
    pub fn next_item(&mut self) -> Result<Option<StompItem>, DecodeError> {
        loop {
            match self.stage {
                Stage::Trailer => match self.buf.first().copied() {
                    None => return Ok(None),
                    Some(b'\n') => {
                        self.buf.advance(1);
                        self.stage = Stage::Command;
                    }
                    Some(b'\r') => {
                        if self.buf.len() < 2 {
                            return Ok(None);
                        }
                        if self.buf[1] == b'\n' {
                            self.buf.advance(2);
                        }
                        self.stage = Stage::Command;
                    }
                    Some(_) => self.stage = Stage::Command,
                },
                Stage::Command => {
                    match self.buf.first().copied() {
                        None => return Ok(None),
                        Some(0) | Some(b'\n') => {
                            self.buf.advance(1);
                            return Ok(Some(StompItem::Heartbeat));
                        }
                        Some(b'\r') => {
                            if self.buf.len() < 2 {
                                return Ok(None);
                            }
                            if self.buf[1] == b'\n' {
                                self.buf.advance(2);
                                return Ok(Some(StompItem::Heartbeat));
                            }
                        }
                        Some(_) => {}
                    }
                    let Some(line) = self.take_line(Line::Command)? else {
                        return Ok(None);
                    };
                    if line.is_empty() || !line.bytes().all(|b| b.is_ascii_alphabetic()) {
                        return Err(DecodeError::MalformedCommand(line));
                    }
                    self.command = line;
                    self.stage = Stage::Headers;
                }
                Stage::Headers => {
                    let Some(line) = self.take_line(Line::Header)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        let content_length = self.declared_content_length()?;
                        self.stage = Stage::Body { content_length };
                        continue;
                    }
                    let header = self.parse_header(&line)?;
                    self.headers.push(header);
                }
                Stage::Body {
                    content_length: Some(len),
                } => {
                    if self.consumed.saturating_add(len) > self.max_frame_size {
                        return Err(DecodeError::FrameTooLarge(self.max_frame_size));
                    }
                    if self.buf.len() <= len {
                        return Ok(None);
                    }
                    if self.buf[len] != 0 {
                        return Err(DecodeError::MissingTerminator(len));
                    }
                    let body = self.buf.split_to(len);
                    self.buf.advance(1);
                    return Ok(Some(self.finish(body)));
                }
                Stage::Body {
                    content_length: None,
                } => {
                    let found = self.buf[self.scanned..].iter().position(|&b| b == 0);
                    match found {
                        Some(rel) => {
                            let body = self.buf.split_to(self.scanned + rel);
                            self.buf.advance(1);
                            return Ok(Some(self.finish(body)));
                        }
                        None => {
                            self.scanned = self.buf.len();
                            self.check_size()?;
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    /// Split off the next LF-terminated line (CR before LF stripped).
    fn take_line(&mut self, kind: Line) -> Result<Option<String>, DecodeError> {
        let found = self.buf[self.scanned..]
            .iter()
            .position(|&b| b == b'\n' || b == 0);
        let Some(rel) = found else {
            self.scanned = self.buf.len();
            self.check_size()?;
            return Ok(None);
        };
        let end = self.scanned + rel;
        if self.buf[end] == 0 {
            return Err(match kind {
                Line::Command => DecodeError::MalformedCommand(
                    String::from_utf8_lossy(&self.buf[..end]).into_owned(),
                ),
                Line::Header => DecodeError::UnterminatedHeader,
            });
        }
        let mut line = self.buf.split_to(end);
        self.buf.advance(1);
        self.scanned = 0;
        self.consumed += end + 1;
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        let what = match kind {
            Line::Command => "command",
            Line::Header => "header",
        };
        String::from_utf8(line.to_vec())
            .map(Some)
            .map_err(|_| DecodeError::InvalidUtf8(what))
    }

    fn parse_header(&self, line: &str) -> Result<(String, String), DecodeError> {
        let Some((raw_key, raw_value)) = line.split_once(':') else {
            return Err(DecodeError::MalformedHeader(line.to_string()));
        };
        if frame_escapes(&self.command, self.version) {
            Ok((
                unescape(raw_key, self.version)?.into_owned(),
                unescape(raw_value, self.version)?.into_owned(),
            ))
        } else {
            Ok((raw_key.to_string(), raw_value.to_string()))
        }
    }

    fn declared_content_length(&self) -> Result<Option<usize>, DecodeError> {
        match self
            .headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| v)
        {
            None => Ok(None),
            Some(v) => {
                let digits = v.trim();
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(DecodeError::InvalidContentLength(v.clone()));
                }
                digits
                    .parse::<usize>()
                    .map(Some)
                    .map_err(|_| DecodeError::InvalidContentLength(v.clone()))
            }
        }
    }

    fn check_size(&self) -> Result<(), DecodeError> {
        if self.consumed.saturating_add(self.buf.len()) > self.max_frame_size {
            return Err(DecodeError::FrameTooLarge(self.max_frame_size));
        }
        Ok(())
    }

    fn finish(&mut self, body: BytesMut) -> StompItem {
        self.stage = Stage::Trailer;
        self.scanned = 0;
        self.consumed = 0;
        StompItem::Frame(Frame {
            command: mem::take(&mut self.command),
            headers: mem::take(&mut self.headers),
            body: body.to_vec(),
        })
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(items: Vec<StompItem>) -> Vec<Frame> {
        items
            .into_iter()
            .filter_map(|i| match i {
                StompItem::Frame(f) => Some(f),
                StompItem::Heartbeat => None,
            })
            .collect()
    }

    #[test]
    fn single_text_frame() {
        let mut dec = FrameDecoder::new();
        let items = dec.feed(b"MESSAGE\ndestination:/queue/a\n\nhi\0").unwrap();
        let f = &frames(items)[0];
        assert_eq!(f.command, "MESSAGE");
        assert_eq!(f.get_header("destination"), Some("/queue/a"));
        assert_eq!(f.body, b"hi");
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn nul_before_command_is_heartbeat() {
        let mut dec = FrameDecoder::new();
        let items = dec.feed(b"\0\0SEND\n\n\0").unwrap();
        assert_eq!(items[0], StompItem::Heartbeat);
        assert_eq!(items[1], StompItem::Heartbeat);
        assert!(matches!(&items[2], StompItem::Frame(f) if f.command == "SEND"));
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn eol_between_frames_is_heartbeat_but_one_trailing_eol_is_padding() {
        let mut dec = FrameDecoder::new();
        let items = dec.feed(b"SEND\n\n\0\r\n\nSEND\n\n\0").unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1], StompItem::Heartbeat);
    }

    #[test]
    fn crlf_line_endings() {
        let mut dec = FrameDecoder::new();
        let items = dec.feed(b"MESSAGE\r\nfoo:bar\r\n\r\nbody\0").unwrap();
        let f = &frames(items)[0];
        assert_eq!(f.command, "MESSAGE");
        assert_eq!(f.get_header("foo"), Some("bar"));
        assert_eq!(f.body, b"body");
    }

    #[test]
    fn partial_input_waits() {
        let mut dec = FrameDecoder::new();
        assert!(dec.feed(b"MESS").unwrap().is_empty());
        assert!(dec.feed(b"AGE\nk:").unwrap().is_empty());
        assert!(dec.feed(b"v\n\nbo").unwrap().is_empty());
        let items = dec.feed(b"dy\0").unwrap();
        assert_eq!(frames(items)[0].body, b"body");
    }

    #[test]
    fn content_length_body_may_contain_nul() {
        let mut dec = FrameDecoder::new();
        let items = dec.feed(b"MESSAGE\ncontent-length:3\n\na\0b\0").unwrap();
        assert_eq!(frames(items)[0].body, b"a\0b");
    }

    #[test]
    fn content_length_waits_for_terminator() {
        let mut dec = FrameDecoder::new();
        assert!(dec.feed(b"SEND\ncontent-length:5\n\nhello").unwrap().is_empty());
        assert_eq!(frames(dec.feed(b"\0").unwrap())[0].body, b"hello");
    }

    #[test]
    fn wrong_content_length_is_missing_terminator() {
        let mut dec = FrameDecoder::new();
        let err = dec.feed(b"SEND\ncontent-length:2\n\nabc\0").unwrap_err();
        assert_eq!(err, DecodeError::MissingTerminator(2));
    }

    #[test]
    fn invalid_content_length_is_error() {
        let mut dec = FrameDecoder::new();
        let err = dec.feed(b"SEND\ncontent-length:xyz\n\nhello\0").unwrap_err();
        assert_eq!(err, DecodeError::InvalidContentLength("xyz".to_string()));
    }

    #[test]
    fn signed_content_length_is_error() {
        for value in ["+5", "-5", ""] {
            let mut dec = FrameDecoder::new();
            let wire = format!("SEND\ncontent-length:{}\n\nhello\0", value);
            let err = dec.feed(wire.as_bytes()).unwrap_err();
            assert_eq!(err, DecodeError::InvalidContentLength(value.to_string()));
        }
    }

    #[test]
    fn without_content_length_body_ends_at_first_nul() {
        let mut dec = FrameDecoder::new();
        dec.push(b"MESSAGE\nsubscription:s\n\na\0b\0");
        let Some(StompItem::Frame(frame)) = dec.next_item().unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(frame.body, b"a");
        // the rest of the body is read as the next command line
        assert_eq!(
            dec.next_item(),
            Err(DecodeError::MalformedCommand("b".to_string()))
        );
    }

    #[test]
    fn first_content_length_is_authoritative() {
        let mut dec = FrameDecoder::new();
        let items = dec
            .feed(b"SEND\ncontent-length:2\ncontent-length:9\n\nab\0")
            .unwrap();
        let f = &frames(items)[0];
        assert_eq!(f.body, b"ab");
        assert_eq!(f.get_all_headers("content-length").count(), 2);
    }

    #[test]
    fn lowercase_command_rejected() {
        let mut dec = FrameDecoder::new();
        assert!(matches!(
            dec.feed(b"send\n\n\0"),
            Err(DecodeError::MalformedCommand(_))
        ));
    }

    #[test]
    fn header_without_colon_rejected() {
        let mut dec = FrameDecoder::new();
        assert!(matches!(
            dec.feed(b"SEND\nnocolon\n\n\0"),
            Err(DecodeError::MalformedHeader(_))
        ));
    }

    #[test]
    fn nul_inside_headers_is_unterminated() {
        let mut dec = FrameDecoder::new();
        assert_eq!(
            dec.feed(b"SEND\nk:v\0"),
            Err(DecodeError::UnterminatedHeader)
        );
    }

    #[test]
    fn unescape_follows_version() {
        let raw = b"MESSAGE\nk:a\\cb\n\n\0";
        let mut v10 = FrameDecoder::new();
        assert_eq!(
            frames(v10.feed(raw).unwrap())[0].get_header("k"),
            Some("a\\cb")
        );
        let mut v12 = FrameDecoder::with_version(Version::V1_2);
        assert_eq!(
            frames(v12.feed(raw).unwrap())[0].get_header("k"),
            Some("a:b")
        );
    }

    #[test]
    fn connected_frame_is_not_unescaped() {
        let mut dec = FrameDecoder::with_version(Version::V1_2);
        let items = dec.feed(b"CONNECTED\nserver:x\\y\n\n\0").unwrap();
        assert_eq!(frames(items)[0].get_header("server"), Some("x\\y"));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut dec = FrameDecoder::new().max_frame_size(16);
        assert_eq!(
            dec.feed(b"SEND\ncontent-length:100\n\n"),
            Err(DecodeError::FrameTooLarge(16))
        );
    }

    #[test]
    fn split_at_every_boundary_matches_whole() {
        let stream: &[u8] =
            b"\0CONNECTED\nversion:1.2\n\n\0\nMESSAGE\ncontent-length:4\nx:\\c\n\n\0\0\0\0\0\n\0SEND\n\nz\0";
        let whole = FrameDecoder::with_version(Version::V1_2)
            .feed(stream)
            .unwrap();
        for cut in 0..=stream.len() {
            let mut dec = FrameDecoder::with_version(Version::V1_2);
            let mut items = dec.feed(&stream[..cut]).unwrap();
            items.extend(dec.feed(&stream[cut..]).unwrap());
            assert_eq!(items, whole, "split at {}", cut);
        }
    }
}
