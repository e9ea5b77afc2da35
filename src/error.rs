use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::frame::Frame;
use crate::transport::TransportError;

/// Malformed input on the wire. Fatal for the session: the decoder does not
/// attempt to resynchronize after returning one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// A backslash followed by a character outside `\\`, `c`, `n`, `r`, or a
    /// dangling backslash at the end of a header token.
    #[error("invalid escape sequence '{0}' in header")]
    InvalidEscape(String),
    #[error("malformed command line: {0:?}")]
    MalformedCommand(String),
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
    /// A NUL arrived before the header block was terminated.
    #[error("header block terminated by NUL before blank line")]
    UnterminatedHeader,
    #[error("invalid content-length '{0}'")]
    InvalidContentLength(String),
    #[error("missing NUL terminator after {0}-byte body")]
    MissingTerminator(usize),
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("frame exceeds maximum size of {0} bytes")]
    FrameTooLarge(usize),
}

/// A broker-sent ERROR frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// The `message` header, or "unknown error" when absent.
    pub message: String,
    /// Body decoded as UTF-8, when present and valid.
    pub body: Option<String>,
    /// The `receipt-id` header, when the error answers a receipted frame.
    pub receipt_id: Option<String>,
    /// The original frame.
    pub frame: Frame,
}

impl ServerError {
    pub fn from_frame(frame: Frame) -> Self {
        let message = frame
            .get_header("message")
            .unwrap_or("unknown error")
            .to_string();
        let body = if frame.body.is_empty() {
            None
        } else {
            frame.body_text().map(str::to_string)
        };
        let receipt_id = frame.get_header("receipt-id").map(str::to_string);
        Self {
            message,
            body,
            receipt_id,
            frame,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "STOMP server error: {}", self.message)?;
        if let Some(body) = &self.body {
            write!(f, " ({})", body)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}

/// Errors returned by client operations and reported through
/// [`ClientEvent::Error`](crate::ClientEvent::Error).
#[derive(Error, Debug)]
pub enum ConnError {
    /// Malformed frame from the peer
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    /// No CONNECTED frame within the configured bound
    #[error("connect timeout: no CONNECTED frame within {0:?}")]
    ConnectTimeout(Duration),
    /// No byte from the peer within tolerance x negotiated incoming interval
    #[error("heartbeat timeout: nothing received for {0:?}")]
    HeartbeatTimeout(Duration),
    /// Protocol-level error (unknown subscription, bad CONNECTED, ...)
    #[error("protocol error: {0}")]
    Protocol(String),
    /// ERROR frame sent by the broker
    #[error("{0}")]
    Server(ServerError),
    /// Underlying channel failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// Receipt timeout error
    #[error("receipt timeout: no RECEIPT received for '{0}' within timeout")]
    ReceiptTimeout(String),
    /// Operation requires an established session
    #[error("not connected")]
    NotConnected,
    /// The session ended before the operation completed
    #[error("session closed before the operation completed")]
    SessionClosed,
}

impl ConnError {
    /// Whether this error ended the session it occurred on.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ConnError::ReceiptTimeout(_) | ConnError::NotConnected | ConnError::SessionClosed
        )
    }
}
