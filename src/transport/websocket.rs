//! WebSocket transport using tokio-tungstenite.
//!
//! STOMP versions are offered as the `v12.stomp`, `v11.stomp`, `v10.stomp`
//! subprotocols. Text and binary messages are both treated as raw bytes.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use super::{CloseInfo, Connector, Transport, TransportError, TransportEvent};
use crate::version::VersionList;

/// Close code used when the peer vanished without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

/// Connects to a `ws://` or `wss://` URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, versions: &VersionList) -> Result<Box<dyn Transport>, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let protocols = versions.websocket_protocols().join(", ");
        let value = HeaderValue::from_str(&protocols)
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", value);

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", self.url, e)))?;
        let selected = response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none")
            .to_string();
        debug!(url = %self.url, subprotocol = %selected, "websocket connected");

        Ok(Box::new(WebSocketTransport {
            stream,
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

fn close_info(frame: Option<CloseFrame<'_>>) -> CloseInfo {
    match frame {
        Some(cf) => CloseInfo {
            code: Some(u16::from(cf.code)),
            reason: cf.reason.into_owned(),
            was_clean: true,
        },
        None => CloseInfo {
            code: Some(ABNORMAL_CLOSURE),
            reason: String::new(),
            was_clean: false,
        },
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.stream
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Result<TransportEvent, TransportError> {
        loop {
            if self.closed {
                return Err(TransportError::Closed);
            }
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(TransportEvent::Data(Bytes::from(data))),
                Some(Ok(Message::Text(text))) => {
                    return Ok(TransportEvent::Data(Bytes::from(text.into_bytes())));
                }
                // tungstenite queues the pong itself
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    self.closed = true;
                    return Ok(TransportEvent::Closed(close_info(frame)));
                }
                Some(Err(WsError::ConnectionClosed)) | None => {
                    self.closed = true;
                    return Ok(TransportEvent::Closed(close_info(None)));
                }
                Some(Err(e)) => {
                    warn!("websocket error: {}", e);
                    self.closed = true;
                    return Err(TransportError::Receive(e.to_string()));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Send(format!("close failed: {}", e))),
        }
    }
}
