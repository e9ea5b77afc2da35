use crate::frame::Frame;
use crate::version::Version;

/// A MESSAGE frame delivered to a subscription callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub frame: Frame,
    /// Protocol version of the session the message arrived on.
    pub version: Version,
}

impl Message {
    pub(crate) fn new(frame: Frame, version: Version) -> Self {
        Self { frame, version }
    }

    pub fn destination(&self) -> Option<&str> {
        self.frame.get_header("destination")
    }

    pub fn subscription(&self) -> Option<&str> {
        self.frame.get_header("subscription")
    }

    pub fn message_id(&self) -> Option<&str> {
        self.frame.get_header("message-id")
    }

    /// The id to pass to [`Client::ack`](crate::Client::ack) /
    /// [`Client::nack`](crate::Client::nack): the `ack` header under 1.2,
    /// `message-id` before that.
    pub fn ack_id(&self) -> Option<&str> {
        match self.version {
            Version::V1_2 => self.frame.get_header("ack").or_else(|| self.message_id()),
            Version::V1_0 | Version::V1_1 => self.message_id(),
        }
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.frame.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.frame.body
    }

    pub fn body_text(&self) -> Option<&str> {
        self.frame.body_text()
    }
}

/// Body of an outgoing SEND.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Text(String),
    Binary(Vec<u8>),
}

impl Default for Body {
    fn default() -> Self {
        Body::Text(String::new())
    }
}

impl Body {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Text(s) => s.as_bytes(),
            Body::Binary(b) => b,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Body::Binary(_))
    }
}

/// Parameters for [`Client::publish`](crate::Client::publish).
///
/// A `content-length` header is computed for non-empty bodies. Binary bodies
/// always carry it, `content-length:0` when empty; for text bodies it can be suppressed with
/// [`skip_content_length_header`](Self::skip_content_length_header), which
/// also drops any `content-length` the caller put in `headers`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Publish {
    pub destination: String,
    pub headers: Vec<(String, String)>,
    pub body: Body,
    pub skip_content_length_header: bool,
}

impl Publish {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            ..Default::default()
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Text(body.into());
        self
    }

    pub fn binary(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Body::Binary(body.into());
        self
    }

    pub fn skip_content_length_header(mut self) -> Self {
        self.skip_content_length_header = true;
        self
    }

    /// Build the SEND frame and decide whether the encoder should compute
    /// `content-length`.
    pub(crate) fn into_frame(self) -> (Frame, bool) {
        let skip = self.skip_content_length_header && !self.body.is_binary();
        let mut frame = Frame::new("SEND")
            .header("destination", self.destination)
            .headers(self.headers);
        if skip {
            frame.remove_header("content-length");
        }
        let binary = self.body.is_binary();
        frame.body = match self.body {
            Body::Text(s) => s.into_bytes(),
            Body::Binary(b) => b,
        };
        // the encoder only computes a length for non-empty bodies
        if binary && frame.body.is_empty() && !frame.has_header("content-length") {
            let at = frame
                .headers
                .iter()
                .position(|(k, _)| k == "content-type" || k == "content-encoding")
                .unwrap_or(frame.headers.len());
            frame
                .headers
                .insert(at, ("content-length".to_string(), "0".to_string()));
        }
        (frame, !skip)
    }
}
