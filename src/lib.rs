//! Async STOMP 1.0/1.1/1.2 client core.
//!
//! The crate has two layers:
//!
//! - a resumable frame codec ([`FrameDecoder`], [`encode_frame`],
//!   [`StompCodec`]) that tolerates chunk boundaries anywhere in a frame,
//! - a [`Client`] that runs the CONNECT handshake, heartbeats,
//!   subscriptions, receipts and reconnection over any [`Transport`].

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod header;
pub mod heartbeat;
pub mod message;
pub mod parser;
pub mod reconnect;
mod session;
pub mod subscription;
pub mod transport;
pub mod version;

pub use codec::{HEARTBEAT, StompCodec, StompItem, encode_frame, encode_frame_into};
pub use config::{ConnectOptions, MAX_HEARTBEAT_TOLERANCE};
pub use connection::{Client, ClientEvent, ConnectionState, EventReceiver};
pub use error::{ConnError, DecodeError, ServerError};
pub use frame::Frame;
pub use heartbeat::{Heartbeat, NegotiatedHeartbeat, negotiate_heartbeats, parse_heartbeat_header};
pub use message::{Body, Message, Publish};
pub use parser::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder};
pub use reconnect::ReconnectDelay;
pub use session::ConnectedInfo;
pub use subscription::{AckMode, Subscription};
pub use transport::{CloseInfo, Connector, TcpConnector, Transport, TransportError, TransportEvent};
#[cfg(feature = "websocket")]
pub use transport::WebSocketConnector;
pub use version::{Version, VersionList};
