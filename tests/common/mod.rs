//! In-memory transport for exercising `Client` without a broker.
//!
//! `MockConnector` hands the client one `MockTransport` per connection
//! attempt and passes the other end, a `MockBroker`, to the test through a
//! `BrokerListener`. The broker side decodes what the client writes with the
//! crate's own `FrameDecoder`.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use stomp_relay::{
    Client, ClientEvent, CloseInfo, Connector, EventReceiver, Frame, FrameDecoder, StompItem,
    Transport, TransportError, TransportEvent, Version, VersionList, encode_frame,
};

/// How the connector answers the next `connect` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Accept,
    Refuse,
    /// Never completes.
    Hang,
}

#[derive(Clone)]
pub struct MockConnector {
    brokers: mpsc::UnboundedSender<MockBroker>,
    mode: Arc<Mutex<Mode>>,
    attempts: Arc<AtomicUsize>,
}

pub struct BrokerListener {
    brokers: mpsc::UnboundedReceiver<MockBroker>,
}

impl MockConnector {
    pub fn new() -> (Self, BrokerListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            brokers: tx,
            mode: Arc::new(Mutex::new(Mode::Accept)),
            attempts: Arc::new(AtomicUsize::new(0)),
        };
        (connector, BrokerListener { brokers: rx })
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Number of `connect` calls so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _versions: &VersionList) -> Result<Box<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        match mode {
            Mode::Refuse => return Err(TransportError::Connect("connection refused".into())),
            Mode::Hang => futures::future::pending::<()>().await,
            Mode::Accept => {}
        }
        let (to_broker, from_client) = mpsc::unbounded_channel();
        let (to_client, from_broker) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let broker = MockBroker {
            from_client,
            to_client,
            decoder: FrameDecoder::with_version(Version::V1_2),
            pending: VecDeque::new(),
            closed: closed.clone(),
        };
        self.brokers
            .send(broker)
            .map_err(|_| TransportError::Connect("listener gone".into()))?;
        Ok(Box::new(MockTransport {
            to_broker,
            from_broker,
            closed,
        }))
    }

    fn describe(&self) -> String {
        "mock".into()
    }
}

impl BrokerListener {
    pub async fn accept(&mut self) -> MockBroker {
        tokio::time::timeout(Duration::from_secs(30), self.brokers.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }
}

struct MockTransport {
    to_broker: mpsc::UnboundedSender<Bytes>,
    from_broker: mpsc::UnboundedReceiver<TransportEvent>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.to_broker
            .send(data)
            .map_err(|_| TransportError::Send("broker gone".into()))
    }

    async fn recv(&mut self) -> Result<TransportEvent, TransportError> {
        match self.from_broker.recv().await {
            Some(event) => Ok(event),
            None => Ok(TransportEvent::Closed(CloseInfo {
                code: Some(1006),
                reason: "broker dropped".into(),
                was_clean: false,
            })),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// The broker end of one connection.
pub struct MockBroker {
    from_client: mpsc::UnboundedReceiver<Bytes>,
    to_client: mpsc::UnboundedSender<TransportEvent>,
    decoder: FrameDecoder,
    pending: VecDeque<StompItem>,
    closed: Arc<AtomicBool>,
}

impl MockBroker {
    /// Next frame or heartbeat written by the client; `None` once the client
    /// side is gone.
    pub async fn next_item(&mut self) -> Option<StompItem> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            let bytes = self.from_client.recv().await?;
            let items = self.decoder.feed(&bytes).expect("client wrote a malformed frame");
            self.pending.extend(items);
        }
    }

    /// Next frame, skipping heartbeats.
    pub async fn next_frame(&mut self) -> Frame {
        let wait = async {
            loop {
                match self.next_item().await {
                    Some(StompItem::Frame(f)) => return f,
                    Some(StompItem::Heartbeat) => continue,
                    None => panic!("client closed while a frame was expected"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(30), wait)
            .await
            .expect("timed out waiting for a frame")
    }

    pub async fn expect_frame(&mut self, command: &str) -> Frame {
        let frame = self.next_frame().await;
        assert_eq!(frame.command, command, "unexpected frame: {}", frame);
        frame
    }

    /// Read CONNECT and answer CONNECTED with the given version and
    /// heart-beat header. Returns the CONNECT frame.
    pub async fn handshake(&mut self, version: &str, heart_beat: &str) -> Frame {
        let connect = self.expect_frame("CONNECT").await;
        self.send_frame(
            Frame::new("CONNECTED")
                .header("version", version)
                .header("heart-beat", heart_beat)
                .header("server", "mock/1.0"),
        );
        connect
    }

    pub fn send_frame(&self, frame: Frame) {
        self.send_raw(&encode_frame(&frame, Version::V1_2, true));
    }

    pub fn send_raw(&self, bytes: &[u8]) {
        let _ = self
            .to_client
            .send(TransportEvent::Data(Bytes::copy_from_slice(bytes)));
    }

    pub fn close(&self, info: CloseInfo) {
        let _ = self.to_client.send(TransportEvent::Closed(info));
    }

    /// Whether the client closed its side.
    pub fn client_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Answer the client's DISCONNECT with its receipt.
    pub async fn acknowledge_disconnect(&mut self) -> Frame {
        let disconnect = self.expect_frame("DISCONNECT").await;
        let receipt = disconnect
            .get_header("receipt")
            .expect("DISCONNECT without receipt")
            .to_string();
        self.send_frame(Frame::new("RECEIPT").header("receipt-id", receipt));
        disconnect
    }
}

pub async fn next_event(events: &mut EventReceiver) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(30), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed")
}

/// Activate `client`, accept its transport and complete the handshake.
pub async fn connect(
    client: &Client,
    listener: &mut BrokerListener,
    events: &mut EventReceiver,
    version: &str,
    heart_beat: &str,
) -> MockBroker {
    client.activate().await;
    let mut broker = listener.accept().await;
    broker.handshake(version, heart_beat).await;
    match next_event(events).await {
        ClientEvent::Connected(_) => {}
        other => panic!("expected Connected, got {:?}", other),
    }
    broker
}

/// Deactivate while the broker acknowledges the DISCONNECT.
pub async fn shutdown(client: &Client, broker: &mut MockBroker) {
    let c = client.clone();
    let stop = tokio::spawn(async move { c.deactivate().await });
    broker.acknowledge_disconnect().await;
    stop.await.expect("deactivate panicked");
}
