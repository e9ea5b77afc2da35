//! Transport seams.
//!
//! The client treats the underlying channel as an opaque duplex byte pipe.
//! A [`Connector`] opens one [`Transport`] per connection attempt; the
//! transport is owned by that attempt and closed on every exit path.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

use crate::version::VersionList;

pub mod tcp;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use tcp::TcpConnector;
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Opening the channel failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Failed to send data.
    #[error("send failed: {0}")]
    Send(String),

    /// Failed to receive data.
    #[error("receive failed: {0}")]
    Receive(String),

    /// The channel is already closed.
    #[error("transport closed")]
    Closed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Details of a channel closure.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseInfo {
    /// Close code, for transports that have one (WebSocket).
    pub code: Option<u16>,
    pub reason: String,
    /// Whether the peer closed with a proper handshake.
    pub was_clean: bool,
}

impl fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "code {}", code)?,
            None => f.write_str("no code")?,
        }
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

/// Something the channel delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Bytes in arrival order. Chunk boundaries carry no meaning.
    Data(Bytes),
    /// The peer closed the channel; no further events follow.
    Closed(CloseInfo),
}

/// An open duplex byte channel.
#[async_trait]
pub trait Transport: Send {
    /// Write `data` to the peer.
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Wait for the next delivery. Must be cancel-safe: the client polls it
    /// inside `select!` alongside timers and caller commands.
    async fn recv(&mut self) -> Result<TransportEvent, TransportError>;

    /// Close the channel. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports. Called once per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new channel. `versions` is what the client will offer in
    /// CONNECT, for transports that negotiate a subprotocol.
    async fn connect(&self, versions: &VersionList) -> Result<Box<dyn Transport>, TransportError>;

    /// Short description for logs.
    fn describe(&self) -> String {
        "transport".to_string()
    }
}
