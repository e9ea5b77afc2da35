//! State of one connection attempt.
//!
//! A fresh `Session` is created for every attempt and torn down when the
//! attempt ends; nothing in it survives a reconnect. It is only touched from
//! the client's driver task, so it needs no locking.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ConnError, ServerError};
use crate::frame::Frame;
use crate::heartbeat::{Heartbeat, NegotiatedHeartbeat, negotiate_heartbeats, parse_heartbeat_header};
use crate::message::Message;
use crate::version::{Version, VersionList};

/// Callback invoked for each MESSAGE on a subscription.
pub(crate) type MessageHandler = Box<dyn FnMut(Message) + Send>;

/// What the broker told us in CONNECTED.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedInfo {
    pub version: Version,
    pub heartbeat: NegotiatedHeartbeat,
    /// `server` header, e.g. "RabbitMQ/3.13".
    pub server: Option<String>,
    /// `session` header.
    pub session: Option<String>,
    pub frame: Frame,
}

/// Outcome of routing one inbound frame.
#[derive(Debug)]
pub(crate) enum Dispatch {
    Delivered,
    /// A RECEIPT; `matched` when a pending operation was waiting for it.
    Receipt { id: String, matched: bool },
    ServerError(ServerError),
    /// MESSAGE for a subscription cancelled earlier in this session.
    Dropped,
    Unhandled(Frame),
}

pub(crate) struct Session {
    version: Version,
    heartbeat: NegotiatedHeartbeat,
    connected: bool,
    receipts: HashMap<String, oneshot::Sender<Frame>>,
    subscriptions: HashMap<String, MessageHandler>,
    unsubscribed: HashSet<String>,
    receipt_counter: u64,
    last_received: Instant,
    sent_since_tick: bool,
}

impl Session {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            version: Version::V1_0,
            heartbeat: NegotiatedHeartbeat::default(),
            connected: false,
            receipts: HashMap::new(),
            subscriptions: HashMap::new(),
            unsubscribed: HashSet::new(),
            receipt_counter: 0,
            last_received: now,
            sent_since_tick: false,
        }
    }

    pub(crate) fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn heartbeat(&self) -> NegotiatedHeartbeat {
        self.heartbeat
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected
    }

    /// Apply a CONNECTED frame: settle the version and heartbeat intervals.
    pub(crate) fn on_connected(
        &mut self,
        frame: &Frame,
        requested: Heartbeat,
        offered: &VersionList,
    ) -> Result<ConnectedInfo, ConnError> {
        let version = match frame.get_header("version") {
            None => Version::V1_0,
            Some(v) => v.parse::<Version>().map_err(ConnError::Protocol)?,
        };
        if !offered.contains(version) {
            return Err(ConnError::Protocol(format!(
                "broker chose version {} which was not offered ({})",
                version,
                offered.accept_version_header()
            )));
        }
        let (sx, sy) = frame
            .get_header("heart-beat")
            .map(parse_heartbeat_header)
            .unwrap_or((0, 0));
        let heartbeat = negotiate_heartbeats(requested.send_ms, requested.receive_ms, sx, sy);

        self.version = version;
        self.heartbeat = heartbeat;
        self.connected = true;
        debug!(%version, ?heartbeat, "session established");

        Ok(ConnectedInfo {
            version,
            heartbeat,
            server: frame.get_header("server").map(str::to_string),
            session: frame.get_header("session").map(str::to_string),
            frame: frame.clone(),
        })
    }

    /// Allocate the next receipt id for this session.
    pub(crate) fn next_receipt_id(&mut self) -> String {
        let id = format!("receipt-{}", self.receipt_counter);
        self.receipt_counter += 1;
        id
    }

    pub(crate) fn expect_receipt(&mut self, id: String, waiter: oneshot::Sender<Frame>) {
        self.receipts.insert(id, waiter);
    }

    pub(crate) fn forget_receipt(&mut self, id: &str) {
        self.receipts.remove(id);
    }

    pub(crate) fn pending_receipts(&self) -> usize {
        self.receipts.len()
    }

    pub(crate) fn add_subscription(&mut self, id: String, handler: MessageHandler) {
        self.unsubscribed.remove(&id);
        self.subscriptions.insert(id, handler);
    }

    /// Returns false when `id` was not subscribed.
    pub(crate) fn remove_subscription(&mut self, id: &str) -> bool {
        if self.subscriptions.remove(id).is_some() {
            self.unsubscribed.insert(id.to_string());
            true
        } else {
            false
        }
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Route a frame received after CONNECTED.
    pub(crate) fn dispatch(&mut self, frame: Frame) -> Result<Dispatch, ConnError> {
        match frame.command.as_str() {
            "MESSAGE" => {
                let Some(sub_id) = frame.get_header("subscription").map(str::to_string) else {
                    return Err(ConnError::Protocol(
                        "MESSAGE without subscription header".to_string(),
                    ));
                };
                if let Some(handler) = self.subscriptions.get_mut(&sub_id) {
                    handler(Message::new(frame, self.version));
                    Ok(Dispatch::Delivered)
                } else if self.unsubscribed.contains(&sub_id) {
                    warn!(subscription = %sub_id, "dropping MESSAGE for cancelled subscription");
                    Ok(Dispatch::Dropped)
                } else {
                    Err(ConnError::Protocol(format!(
                        "MESSAGE for unknown subscription '{}'",
                        sub_id
                    )))
                }
            }
            "RECEIPT" => {
                let id = frame.get_header("receipt-id").unwrap_or_default().to_string();
                match self.receipts.remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(frame);
                        Ok(Dispatch::Receipt { id, matched: true })
                    }
                    None => {
                        debug!(receipt = %id, "RECEIPT with no pending operation");
                        Ok(Dispatch::Receipt { id, matched: false })
                    }
                }
            }
            "ERROR" => Ok(Dispatch::ServerError(ServerError::from_frame(frame))),
            _ => Ok(Dispatch::Unhandled(frame)),
        }
    }

    pub(crate) fn mark_received(&mut self, now: Instant) {
        self.last_received = now;
    }

    pub(crate) fn mark_sent(&mut self) {
        self.sent_since_tick = true;
    }

    /// Called on each outgoing-heartbeat tick; true when nothing was sent
    /// since the previous tick and a heartbeat byte is due.
    pub(crate) fn outgoing_tick(&mut self) -> bool {
        let due = !self.sent_since_tick;
        self.sent_since_tick = false;
        due
    }

    /// Time since the peer was last heard from, when that exceeds
    /// `tolerance` x the negotiated incoming interval. A limit too large to
    /// represent never expires.
    pub(crate) fn incoming_overdue(&self, now: Instant, tolerance: f64) -> Option<Duration> {
        let interval = self.heartbeat.incoming?;
        let limit =
            Duration::try_from_secs_f64(interval.as_secs_f64() * tolerance.max(1.0)).ok()?;
        let silent = now.saturating_duration_since(self.last_received);
        (silent > limit).then_some(silent)
    }

    /// Drop every pending operation and subscription without completing
    /// them. Waiters observe a closed channel.
    pub(crate) fn teardown(&mut self) {
        self.receipts.clear();
        self.subscriptions.clear();
        self.unsubscribed.clear();
        self.connected = false;
    }
}
