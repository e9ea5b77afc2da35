use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::DecodeError;
use crate::frame::Frame;
use crate::header::{escape, frame_escapes};
use crate::parser::FrameDecoder;
use crate::version::Version;

/// Items produced by the decoder and consumed by the encoder.
///
/// A `StompItem` is either a complete `Frame` or a `Heartbeat` marker for a
/// lone heartbeat byte received between frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    /// A decoded STOMP frame (command + headers + body)
    Frame(Frame),
    /// A single heartbeat pulse
    Heartbeat,
}

/// Wire encoding of an outgoing heartbeat: a single NUL, no line feed.
pub const HEARTBEAT: &[u8] = &[0];

/// Headers describing the body; a computed `content-length` is placed ahead
/// of the first of these.
const BODY_HEADERS: &[&str] = &["content-type", "content-encoding"];

/// Serialize `frame` into `dst`.
///
/// Header keys and values are escaped according to `version` (never for
/// CONNECT/STOMP/CONNECTED). When `compute_content_length` is set, the body
/// is non-empty and the caller did not supply its own `content-length`, one
/// is inserted carrying the exact body length.
pub fn encode_frame_into(
    frame: &Frame,
    version: Version,
    compute_content_length: bool,
    dst: &mut BytesMut,
) {
    let escaping = frame_escapes(&frame.command, version);
    let computed = if compute_content_length
        && !frame.body.is_empty()
        && !frame.has_header("content-length")
    {
        Some(frame.body.len().to_string())
    } else {
        None
    };
    let insert_at = computed.as_ref().map(|_| {
        frame
            .headers
            .iter()
            .position(|(k, _)| BODY_HEADERS.contains(&k.as_str()))
            .unwrap_or(frame.headers.len())
    });

    dst.reserve(frame.command.len() + frame.body.len() + 64);
    dst.extend_from_slice(frame.command.as_bytes());
    dst.put_u8(b'\n');

    let put_header = |dst: &mut BytesMut, k: &str, v: &str| {
        if escaping {
            dst.extend_from_slice(escape(k, version).as_bytes());
            dst.put_u8(b':');
            dst.extend_from_slice(escape(v, version).as_bytes());
        } else {
            dst.extend_from_slice(k.as_bytes());
            dst.put_u8(b':');
            dst.extend_from_slice(v.as_bytes());
        }
        dst.put_u8(b'\n');
    };

    for (i, (k, v)) in frame.headers.iter().enumerate() {
        if insert_at == Some(i) {
            if let Some(len) = &computed {
                put_header(dst, "content-length", len);
            }
        }
        put_header(dst, k, v);
    }
    if insert_at == Some(frame.headers.len()) {
        if let Some(len) = &computed {
            put_header(dst, "content-length", len);
        }
    }

    dst.put_u8(b'\n');
    dst.extend_from_slice(&frame.body);
    dst.put_u8(0);
}

/// Serialize `frame` into a fresh buffer. See [`encode_frame_into`].
pub fn encode_frame(frame: &Frame, version: Version, compute_content_length: bool) -> Bytes {
    let mut dst = BytesMut::new();
    encode_frame_into(frame, version, compute_content_length, &mut dst);
    dst.freeze()
}

/// `StompCodec` implements `tokio_util::codec::{Decoder, Encoder}` for the
/// STOMP wire protocol, for callers that drive a byte stream with `Framed`
/// instead of going through [`Client`](crate::Client).
///
/// Decoding is delegated to a [`FrameDecoder`]; frames are encoded with a
/// computed `content-length` whenever they carry a body.
pub struct StompCodec {
    decoder: FrameDecoder,
}

impl StompCodec {
    pub fn new() -> Self {
        Self::with_version(Version::V1_2)
    }

    pub fn with_version(version: Version) -> Self {
        Self {
            decoder: FrameDecoder::with_version(version),
        }
    }

    pub fn version(&self) -> Version {
        self.decoder.version()
    }

    pub fn set_version(&mut self, version: Version) {
        self.decoder.set_version(version);
    }
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for StompCodec {
    type Item = StompItem;
    type Error = std::io::Error;

    /// Move everything in `src` into the resumable decoder and return the
    /// next complete item, if any. `src` is always drained; partial frames
    /// are retained inside the codec.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !src.is_empty() {
            let chunk = src.split();
            self.decoder.push(&chunk);
        }
        Ok(self.decoder.next_item()?)
    }

    /// Like `decode`, but a partial frame left over when the stream ends is
    /// an error instead of being dropped.
    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(item) => Ok(Some(item)),
            None if !self.decoder.is_between_frames() => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "stream ended inside a frame",
            )),
            None => Ok(None),
        }
    }
}

impl Encoder<StompItem> for StompCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            StompItem::Heartbeat => dst.extend_from_slice(HEARTBEAT),
            StompItem::Frame(frame) => encode_frame_into(&frame, self.version(), true, dst),
        }
        Ok(())
    }
}

impl From<DecodeError> for std::io::Error {
    fn from(err: DecodeError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(b: &Bytes) -> String {
        String::from_utf8_lossy(b).into_owned()
    }

    #[test]
    fn layout_matches_wire_format() {
        let f = Frame::new("SEND").header("destination", "/q").set_body("hi");
        let out = encode_frame(&f, Version::V1_2, false);
        assert_eq!(&out[..], b"SEND\ndestination:/q\n\nhi\0");
    }

    #[test]
    fn content_length_computed() {
        let f = Frame::new("SEND").header("destination", "/q").set_body("hello");
        let out = encode_frame(&f, Version::V1_2, true);
        assert_eq!(text(&out), "SEND\ndestination:/q\ncontent-length:5\n\nhello\0");
    }

    #[test]
    fn content_length_precedes_content_type() {
        let f = Frame::new("SEND")
            .header("destination", "/q")
            .header("content-type", "text/plain")
            .set_body("abc");
        let out = encode_frame(&f, Version::V1_2, true);
        assert_eq!(
            text(&out),
            "SEND\ndestination:/q\ncontent-length:3\ncontent-type:text/plain\n\nabc\0"
        );
    }

    #[test]
    fn caller_content_length_wins() {
        let f = Frame::new("SEND").header("content-length", "2").set_body("ab");
        let out = encode_frame(&f, Version::V1_2, true);
        assert_eq!(text(&out).matches("content-length").count(), 1);
    }

    #[test]
    fn empty_body_gets_no_content_length() {
        let out = encode_frame(&Frame::new("SEND"), Version::V1_2, true);
        assert_eq!(&out[..], b"SEND\n\n\0");
    }

    #[test]
    fn headers_escaped_except_connect() {
        let f = Frame::new("SEND").header("k:1", "a\nb");
        assert_eq!(
            text(&encode_frame(&f, Version::V1_2, false)),
            "SEND\nk\\c1:a\\nb\n\n\0"
        );
        let c = Frame::new("CONNECT").header("passcode", "p:w");
        assert_eq!(
            text(&encode_frame(&c, Version::V1_2, false)),
            "CONNECT\npasscode:p:w\n\n\0"
        );
        assert_eq!(
            text(&encode_frame(&f, Version::V1_0, false)),
            "SEND\nk:1:a\nb\n\n\0"
        );
    }

    #[test]
    fn codec_heartbeat_is_single_nul() {
        let mut codec = StompCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(StompItem::Heartbeat, &mut dst).unwrap();
        assert_eq!(&dst[..], &[0u8]);
    }
}
