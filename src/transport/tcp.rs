//! Plain TCP transport (the usual broker port, e.g. 61613).

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::{CloseInfo, Connector, Transport, TransportError, TransportEvent};
use crate::version::VersionList;

const READ_CHUNK: usize = 8 * 1024;

/// Connects to `host:port` over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, _versions: &VersionList) -> Result<Box<dyn Transport>, TransportError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", self.addr, e)))?;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "tcp connected");
        Ok(Box::new(TcpTransport {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

pub struct TcpTransport {
    stream: TcpStream,
    read_buf: BytesMut,
    closed: bool,
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.stream
            .write_all(&data)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Result<TransportEvent, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.read_buf.reserve(READ_CHUNK);
        // read_buf is cancel-safe: no bytes are lost if this future is dropped
        let n = self
            .stream
            .read_buf(&mut self.read_buf)
            .await
            .map_err(|e| TransportError::Receive(e.to_string()))?;
        if n == 0 {
            self.closed = true;
            return Ok(TransportEvent::Closed(CloseInfo {
                code: None,
                reason: "connection closed by peer".to_string(),
                was_clean: true,
            }));
        }
        Ok(TransportEvent::Data(self.read_buf.split().freeze()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream.shutdown().await?;
        Ok(())
    }
}
