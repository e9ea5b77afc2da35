//! The client handle and its driver task.
//!
//! [`Client`] is a cheap, cloneable handle. [`Client::activate`] spawns one
//! driver task which owns the transport, the frame decoder, the per-attempt
//! [`Session`] and all timers. Caller operations are sent to it over a
//! channel, so transport input, timer ticks and caller requests are handled
//! strictly one at a time.

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{self, BoxFuture, Shared};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep, sleep_until};
use tracing::{debug, error, info, trace, warn};

use crate::codec::{HEARTBEAT, StompItem, encode_frame};
use crate::config::ConnectOptions;
use crate::error::{ConnError, ServerError};
use crate::frame::Frame;
use crate::heartbeat::NegotiatedHeartbeat;
use crate::message::{Message, Publish};
use crate::parser::FrameDecoder;
use crate::reconnect::Backoff;
use crate::session::{ConnectedInfo, Dispatch, MessageHandler, Session};
use crate::subscription::{AckMode, Subscription};
use crate::transport::{CloseInfo, Connector, Transport, TransportError, TransportEvent};
use crate::version::Version;

/// Lifecycle state of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// A session failed; the client is tearing it down.
    ErroredOut,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::ErroredOut => "errored-out",
        };
        f.write_str(s)
    }
}

/// Notifications delivered on the [`EventReceiver`].
///
/// Every fatal condition produces exactly one of `Error`, `TransportClosed`
/// or `TransportError` before the session is torn down.
#[derive(Debug)]
pub enum ClientEvent {
    Connected(ConnectedInfo),
    /// A RECEIPT arrived for `receipt-id`.
    Receipt(String),
    Error(ConnError),
    TransportClosed(CloseInfo),
    TransportError(String),
    /// A caller-initiated disconnect completed.
    Disconnected,
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// A frame the client has no use for.
    UnhandledFrame(Frame),
}

pub type EventReceiver = mpsc::UnboundedReceiver<ClientEvent>;

type Reply<T> = oneshot::Sender<Result<T, ConnError>>;

enum Command {
    Send {
        frame: Frame,
        compute_content_length: bool,
        receipt: Option<oneshot::Sender<Frame>>,
        reply: Reply<Option<String>>,
    },
    ForgetReceipt(String),
    Subscribe {
        id: String,
        frame: Frame,
        handler: MessageHandler,
        reply: Reply<()>,
    },
    Unsubscribe {
        id: String,
        headers: Vec<(String, String)>,
        reply: Reply<()>,
    },
    Ack {
        nack: bool,
        message_id: String,
        subscription: String,
        headers: Vec<(String, String)>,
        reply: Reply<()>,
    },
    Disconnect {
        headers: Vec<(String, String)>,
    },
    ForceDisconnect,
}

/// Answer a command that arrived while no session is open.
fn reject(cmd: Command) {
    match cmd {
        Command::Send { reply, .. } => {
            let _ = reply.send(Err(ConnError::NotConnected));
        }
        Command::Subscribe { reply, .. }
        | Command::Unsubscribe { reply, .. }
        | Command::Ack { reply, .. } => {
            let _ = reply.send(Err(ConnError::NotConnected));
        }
        Command::ForgetReceipt(_) | Command::Disconnect { .. } | Command::ForceDisconnect => {}
    }
}

struct Inner {
    connector: Box<dyn Connector>,
    options: ConnectOptions,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            debug!(from = %prev, to = %state, "state change");
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Clone)]
struct Runner {
    commands: mpsc::UnboundedSender<Command>,
    finished: Shared<BoxFuture<'static, ()>>,
}

/// Handle to a STOMP client.
///
/// Cloning is cheap; all clones drive the same connection. The client does
/// nothing until [`activate`](Self::activate) is called.
///
/// ```no_run
/// use stomp_relay::{Client, ClientEvent, ConnectOptions, Publish, TcpConnector};
///
/// # async fn run() -> Result<(), stomp_relay::ConnError> {
/// let (client, mut events) = Client::new(
///     TcpConnector::new("127.0.0.1:61613"),
///     ConnectOptions::default().login("guest", "guest"),
/// );
/// client.activate().await;
/// while let Some(event) = events.recv().await {
///     if let ClientEvent::Connected(_) = event {
///         client.publish(Publish::new("/queue/test").text("hello")).await?;
///         break;
///     }
/// }
/// client.deactivate().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
    runner: Arc<Mutex<Option<Runner>>>,
    sub_ids: Arc<AtomicU64>,
}

impl Client {
    /// Create a client and the receiving end of its event stream.
    pub fn new<C>(connector: C, options: ConnectOptions) -> (Self, EventReceiver)
    where
        C: Connector + 'static,
    {
        let (events, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(Inner {
            connector: Box::new(connector),
            options,
            events,
            state,
            attempts: AtomicU32::new(0),
        });
        let client = Self {
            inner,
            runner: Arc::new(Mutex::new(None)),
            sub_ids: Arc::new(AtomicU64::new(0)),
        };
        (client, rx)
    }

    /// Start connecting, reconnecting after failures when enabled.
    /// Does nothing if the client is already active.
    pub async fn activate(&self) {
        self.connect(Vec::new()).await
    }

    /// Like [`activate`](Self::activate), adding `headers` to every CONNECT
    /// frame sent during this activation.
    pub async fn connect(&self, headers: Vec<(String, String)>) {
        let mut runner = self.runner.lock().await;
        if let Some(active) = runner.as_ref() {
            if !active.commands.is_closed() {
                debug!("client already active");
                return;
            }
        }
        let (commands, rx) = mpsc::unbounded_channel();
        let driver = Driver {
            inner: self.inner.clone(),
            commands: rx,
            connect_headers: headers,
            backoff: Backoff::new(self.inner.options.reconnect_delay.clone()),
            orphaned: false,
        };
        let task = tokio::spawn(driver.run());
        let finished = task.map(|_| ()).boxed().shared();
        *runner = Some(Runner { commands, finished });
    }

    /// Gracefully disconnect and stop reconnecting. Resolves once the
    /// client is fully stopped; calling it again is a no-op.
    pub async fn deactivate(&self) {
        self.disconnect(Vec::new()).await
    }

    /// Like [`deactivate`](Self::deactivate), adding `headers` to the
    /// DISCONNECT frame. A `receipt` header in `headers` is used as the
    /// disconnect receipt id.
    pub async fn disconnect(&self, headers: Vec<(String, String)>) {
        let runner = self.runner.lock().await.clone();
        let Some(runner) = runner else {
            return;
        };
        let _ = runner.commands.send(Command::Disconnect { headers });
        runner.finished.await;
    }

    /// Drop the transport immediately without a DISCONNECT. This counts as
    /// an unplanned closure, so reconnection applies.
    pub async fn force_disconnect(&self) {
        let _ = self.command(Command::ForceDisconnect).await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver observing every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the client is in `target`. Returns immediately if it
    /// already is.
    pub async fn wait_for_state(&self, target: ConnectionState) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == target).await;
    }

    /// Consecutive failed attempts since the last CONNECTED.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    async fn command(&self, cmd: Command) -> Result<(), ConnError> {
        let runner = self.runner.lock().await;
        let runner = runner.as_ref().ok_or(ConnError::NotConnected)?;
        runner
            .commands
            .send(cmd)
            .map_err(|_| ConnError::NotConnected)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ConnError> {
        let (reply, rx) = oneshot::channel();
        self.command(build(reply)).await?;
        rx.await.map_err(|_| ConnError::SessionClosed)?
    }

    async fn send_raw(
        &self,
        frame: Frame,
        compute_content_length: bool,
        receipt: Option<oneshot::Sender<Frame>>,
    ) -> Result<Option<String>, ConnError> {
        self.request(|reply| Command::Send {
            frame,
            compute_content_length,
            receipt,
            reply,
        })
        .await
    }

    async fn send_confirmed(
        &self,
        frame: Frame,
        compute_content_length: bool,
        timeout: Duration,
    ) -> Result<Frame, ConnError> {
        let (tx, rx) = oneshot::channel();
        let receipt_id = self
            .send_raw(frame, compute_content_length, Some(tx))
            .await?
            .unwrap_or_default();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(receipt)) => Ok(receipt),
            Ok(Err(_)) => Err(ConnError::SessionClosed),
            Err(_) => {
                let _ = self.command(Command::ForgetReceipt(receipt_id.clone())).await;
                Err(ConnError::ReceiptTimeout(receipt_id))
            }
        }
    }

    /// Send a SEND frame.
    pub async fn publish(&self, publish: Publish) -> Result<(), ConnError> {
        let (frame, compute) = publish.into_frame();
        self.send_raw(frame, compute, None).await.map(|_| ())
    }

    /// Send a SEND frame with a `receipt` header and wait up to `timeout`
    /// for the broker's RECEIPT, which is returned.
    ///
    /// If the session ends first the result is
    /// [`ConnError::SessionClosed`]; the message may or may not have been
    /// processed.
    pub async fn publish_with_receipt(
        &self,
        publish: Publish,
        timeout: Duration,
    ) -> Result<Frame, ConnError> {
        let (frame, compute) = publish.into_frame();
        self.send_confirmed(frame, compute, timeout).await
    }

    /// Send an arbitrary frame. `content-length` is computed for non-empty
    /// bodies unless the frame already carries one.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), ConnError> {
        self.send_raw(frame, true, None).await.map(|_| ())
    }

    /// Send an arbitrary frame and wait for its RECEIPT. A `receipt` header
    /// already on the frame is kept; otherwise one is generated.
    pub async fn send_frame_confirmed(
        &self,
        frame: Frame,
        timeout: Duration,
    ) -> Result<Frame, ConnError> {
        self.send_confirmed(frame, true, timeout).await
    }

    /// Subscribe to `destination`, invoking `handler` for every MESSAGE on
    /// the subscription.
    ///
    /// An `id` entry in `headers` is used as the subscription id; otherwise
    /// `sub-N` is generated from a client-wide counter. The handler runs on
    /// the driver task and must not block.
    pub async fn subscribe<F>(
        &self,
        destination: &str,
        handler: F,
        headers: Vec<(String, String)>,
    ) -> Result<Subscription, ConnError>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let mut headers = headers;
        let id = match headers.iter().position(|(k, _)| k == "id") {
            Some(pos) => headers.remove(pos).1,
            None => format!("sub-{}", self.sub_ids.fetch_add(1, Ordering::SeqCst)),
        };
        let frame = Frame::new("SUBSCRIBE")
            .header("id", id.as_str())
            .header("destination", destination)
            .headers(headers);
        let handler: MessageHandler = Box::new(handler);
        let sub_id = id.clone();
        self.request(|reply| Command::Subscribe {
            id: sub_id,
            frame,
            handler,
            reply,
        })
        .await?;
        Ok(Subscription::new(id, destination.to_string(), self.clone()))
    }

    /// [`subscribe`](Self::subscribe) with an explicit `ack` mode.
    pub async fn subscribe_with_ack<F>(
        &self,
        destination: &str,
        ack: AckMode,
        handler: F,
    ) -> Result<Subscription, ConnError>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let headers = vec![("ack".to_string(), ack.as_str().to_string())];
        self.subscribe(destination, handler, headers).await
    }

    /// Send UNSUBSCRIBE for `subscription_id`. Fails with
    /// [`ConnError::Protocol`] when the id is not subscribed in the current
    /// session.
    pub async fn unsubscribe(
        &self,
        subscription_id: &str,
        headers: Vec<(String, String)>,
    ) -> Result<(), ConnError> {
        let id = subscription_id.to_string();
        self.request(|reply| Command::Unsubscribe { id, headers, reply })
            .await
    }

    /// Acknowledge a message. `message_id` is the value of
    /// [`Message::ack_id`]; it is sent as `id` under STOMP 1.2 and as
    /// `message-id` under earlier versions.
    pub async fn ack(
        &self,
        message_id: &str,
        subscription_id: &str,
        headers: Vec<(String, String)>,
    ) -> Result<(), ConnError> {
        self.acknowledge(false, message_id, subscription_id, headers)
            .await
    }

    /// Negative-acknowledge a message. Same addressing as [`ack`](Self::ack).
    pub async fn nack(
        &self,
        message_id: &str,
        subscription_id: &str,
        headers: Vec<(String, String)>,
    ) -> Result<(), ConnError> {
        self.acknowledge(true, message_id, subscription_id, headers)
            .await
    }

    async fn acknowledge(
        &self,
        nack: bool,
        message_id: &str,
        subscription_id: &str,
        headers: Vec<(String, String)>,
    ) -> Result<(), ConnError> {
        let message_id = message_id.to_string();
        let subscription = subscription_id.to_string();
        self.request(|reply| Command::Ack {
            nack,
            message_id,
            subscription,
            headers,
            reply,
        })
        .await
    }

    pub async fn begin(&self, transaction_id: &str) -> Result<(), ConnError> {
        self.send_frame(Frame::new("BEGIN").header("transaction", transaction_id))
            .await
    }

    pub async fn commit(&self, transaction_id: &str) -> Result<(), ConnError> {
        self.send_frame(Frame::new("COMMIT").header("transaction", transaction_id))
            .await
    }

    pub async fn abort(&self, transaction_id: &str) -> Result<(), ConnError> {
        self.send_frame(Frame::new("ABORT").header("transaction", transaction_id))
            .await
    }
}

/// Used when a configured timeout does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `after` from now, saturating at a far-future instant.
fn deadline_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// How a connection attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// The caller asked for it.
    Planned,
    Failed,
    /// The peer sent bytes that do not decode; never retried.
    Fatal,
}

enum Phase {
    /// CONNECT sent, waiting for CONNECTED.
    Handshake,
    Open,
    /// DISCONNECT sent, waiting for its receipt.
    Closing { receipt_id: String, deadline: Instant },
}

impl Phase {
    fn is_closing(&self) -> bool {
        matches!(self, Phase::Closing { .. })
    }

    fn closing_deadline(&self) -> Instant {
        match self {
            Phase::Closing { deadline, .. } => *deadline,
            _ => deadline_after(FAR_FUTURE),
        }
    }
}

/// One open transport and the protocol state riding on it.
struct Link {
    transport: Box<dyn Transport>,
    decoder: FrameDecoder,
    session: Session,
}

impl Link {
    async fn send_frame(&mut self, frame: &Frame, compute_content_length: bool) -> Result<(), TransportError> {
        let bytes = encode_frame(frame, self.session.version(), compute_content_length);
        self.transport.send(bytes).await?;
        self.session.mark_sent();
        debug!(command = %frame.command, ">>>");
        Ok(())
    }
}

#[derive(Default)]
struct Timers {
    outgoing: Option<Interval>,
    incoming: Option<Interval>,
}

impl Timers {
    fn start(heartbeat: NegotiatedHeartbeat) -> Self {
        Self {
            outgoing: heartbeat.outgoing.map(ticker),
            incoming: heartbeat.incoming.map(ticker),
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(deadline_after(period), period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Next tick of `timer`, or never when the timer is disabled.
async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending::<()>().await,
    }
}

struct Driver {
    inner: Arc<Inner>,
    commands: mpsc::UnboundedReceiver<Command>,
    connect_headers: Vec<(String, String)>,
    backoff: Backoff,
    /// Every `Client` handle is gone.
    orphaned: bool,
}

impl Driver {
    async fn run(mut self) {
        info!(target = %self.inner.connector.describe(), "client activated");
        loop {
            match self.attempt().await {
                Exit::Planned => {
                    self.inner.set_state(ConnectionState::Disconnected);
                    self.inner.emit(ClientEvent::Disconnected);
                    break;
                }
                Exit::Fatal => {
                    self.inner.set_state(ConnectionState::Disconnected);
                    info!("stream corrupt, client stopped without reconnecting");
                    break;
                }
                Exit::Failed => {
                    self.inner.set_state(ConnectionState::Disconnected);
                    if !self.inner.options.reconnect {
                        info!("reconnect disabled, client stopped");
                        break;
                    }
                    let (attempt, delay) = self.backoff.next();
                    self.inner.attempts.store(attempt, Ordering::SeqCst);
                    info!(attempt, ?delay, "reconnect scheduled");
                    self.inner
                        .emit(ClientEvent::ReconnectScheduled { attempt, delay });
                    if !self.wait_for_retry(delay).await {
                        info!("reconnect cancelled");
                        self.inner.emit(ClientEvent::Disconnected);
                        break;
                    }
                }
            }
        }
    }

    /// Sleep out the reconnect delay. False when deactivated meanwhile.
    async fn wait_for_retry(&mut self, delay: Duration) -> bool {
        let retry = sleep(delay);
        tokio::pin!(retry);
        loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Disconnect { .. }) => return false,
                    Some(cmd) => reject(cmd),
                },
                _ = &mut retry => return true,
            }
        }
    }

    fn fail(&self, event: ClientEvent) -> Exit {
        self.inner.set_state(ConnectionState::ErroredOut);
        self.inner.emit(event);
        Exit::Failed
    }

    /// Like `fail`, but a failure while already disconnecting still ends
    /// as planned.
    fn fail_in(&self, phase: &Phase, event: ClientEvent) -> Exit {
        if phase.is_closing() {
            self.inner.emit(event);
            Exit::Planned
        } else {
            self.fail(event)
        }
    }

    /// Like `fail_in`, but the client is not reconnected afterwards.
    fn abandon_in(&self, phase: &Phase, event: ClientEvent) -> Exit {
        match self.fail_in(phase, event) {
            Exit::Failed => Exit::Fatal,
            exit => exit,
        }
    }

    async fn attempt(&mut self) -> Exit {
        let inner = self.inner.clone();
        inner.set_state(ConnectionState::Connecting);
        let connect_timeout = inner.options.connect_timeout;
        let deadline = deadline_after(connect_timeout);
        debug!(target = %inner.connector.describe(), "opening transport");

        let open = tokio::time::timeout_at(
            deadline,
            inner.connector.connect(&inner.options.accept_version),
        );
        tokio::pin!(open);
        let transport = loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Disconnect { .. }) => return Exit::Planned,
                    Some(cmd) => reject(cmd),
                },
                res = &mut open => match res {
                    Ok(Ok(transport)) => break transport,
                    Ok(Err(e)) => {
                        warn!("failed to open transport: {}", e);
                        return self.fail(ClientEvent::TransportError(e.to_string()));
                    }
                    Err(_) => {
                        warn!(?connect_timeout, "transport did not open in time");
                        return self.fail(ClientEvent::Error(ConnError::ConnectTimeout(connect_timeout)));
                    }
                },
            }
        };

        let mut link = Link {
            transport,
            decoder: FrameDecoder::new().max_frame_size(inner.options.max_frame_size),
            session: Session::new(Instant::now()),
        };
        let exit = self.run_session(&mut link, deadline).await;
        if link.session.is_connected() {
            debug!(
                pending_receipts = link.session.pending_receipts(),
                subscriptions = link.session.subscription_count(),
                ?exit,
                "session ended"
            );
        }
        link.session.teardown();
        if let Err(e) = link.transport.close().await {
            debug!("error closing transport: {}", e);
        }
        exit
    }

    async fn run_session(&mut self, link: &mut Link, connect_deadline: Instant) -> Exit {
        let connect = Frame::new("CONNECT")
            .headers(self.inner.options.connect_headers())
            .headers(self.connect_headers.clone());
        if let Err(e) = link.send_frame(&connect, false).await {
            warn!("failed to send CONNECT: {}", e);
            return self.fail(ClientEvent::TransportError(e.to_string()));
        }

        let mut phase = Phase::Handshake;
        let mut timers = Timers::default();
        loop {
            let step = tokio::select! {
                biased;
                cmd = self.commands.recv(), if !self.orphaned => self.on_command(link, &mut phase, cmd).await,
                ev = link.transport.recv() => self.on_transport(link, &mut phase, &mut timers, ev),
                _ = tick(&mut timers.incoming) => self.on_incoming_tick(link, &phase),
                _ = tick(&mut timers.outgoing) => self.on_outgoing_tick(link).await,
                _ = sleep_until(connect_deadline), if matches!(phase, Phase::Handshake) => {
                    let timeout = self.inner.options.connect_timeout;
                    warn!(?timeout, "no CONNECTED frame in time");
                    Some(self.fail(ClientEvent::Error(ConnError::ConnectTimeout(timeout))))
                }
                _ = sleep_until(phase.closing_deadline()), if phase.is_closing() => {
                    warn!("no RECEIPT for DISCONNECT, closing anyway");
                    Some(Exit::Planned)
                }
            };
            if let Some(exit) = step {
                return exit;
            }
        }
    }

    async fn on_command(
        &mut self,
        link: &mut Link,
        phase: &mut Phase,
        cmd: Option<Command>,
    ) -> Option<Exit> {
        let Some(cmd) = cmd else {
            debug!("all client handles dropped");
            self.orphaned = true;
            return self.begin_disconnect(link, phase, Vec::new()).await;
        };
        match cmd {
            Command::Disconnect { headers } => self.begin_disconnect(link, phase, headers).await,
            Command::ForceDisconnect => {
                info!("transport closed by caller");
                let info = CloseInfo {
                    code: None,
                    reason: "closed by client".to_string(),
                    was_clean: false,
                };
                Some(self.fail_in(phase, ClientEvent::TransportClosed(info)))
            }
            cmd if !matches!(phase, Phase::Open) => {
                reject(cmd);
                None
            }
            Command::ForgetReceipt(id) => {
                link.session.forget_receipt(&id);
                None
            }
            Command::Send {
                mut frame,
                compute_content_length,
                receipt,
                reply,
            } => {
                let receipt_id = receipt.map(|waiter| {
                    let id = match frame.get_header("receipt") {
                        Some(id) => id.to_string(),
                        None => {
                            let id = link.session.next_receipt_id();
                            frame.headers.push(("receipt".to_string(), id.clone()));
                            id
                        }
                    };
                    link.session.expect_receipt(id.clone(), waiter);
                    id
                });
                match link.send_frame(&frame, compute_content_length).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(receipt_id));
                        None
                    }
                    Err(e) => Some(self.send_failed(reply, e)),
                }
            }
            Command::Subscribe {
                id,
                frame,
                handler,
                reply,
            } => {
                link.session.add_subscription(id.clone(), handler);
                match link.send_frame(&frame, false).await {
                    Ok(()) => {
                        debug!(subscription = %id, "subscribed");
                        let _ = reply.send(Ok(()));
                        None
                    }
                    Err(e) => Some(self.send_failed(reply, e)),
                }
            }
            Command::Unsubscribe { id, headers, reply } => {
                if !link.session.remove_subscription(&id) {
                    let _ = reply.send(Err(ConnError::Protocol(format!(
                        "subscription id '{}' not found",
                        id
                    ))));
                    return None;
                }
                let frame = Frame::new("UNSUBSCRIBE")
                    .header("id", id.as_str())
                    .headers(headers);
                match link.send_frame(&frame, false).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                        None
                    }
                    Err(e) => Some(self.send_failed(reply, e)),
                }
            }
            Command::Ack {
                nack,
                message_id,
                subscription,
                headers,
                reply,
            } => {
                let command = if nack { "NACK" } else { "ACK" };
                let id_header = match link.session.version() {
                    Version::V1_2 => "id",
                    Version::V1_0 | Version::V1_1 => "message-id",
                };
                let frame = Frame::new(command)
                    .header(id_header, message_id)
                    .header("subscription", subscription)
                    .headers(headers);
                match link.send_frame(&frame, false).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                        None
                    }
                    Err(e) => Some(self.send_failed(reply, e)),
                }
            }
        }
    }

    fn send_failed<T>(&self, reply: Reply<T>, err: TransportError) -> Exit {
        let reason = err.to_string();
        warn!("send failed: {}", reason);
        let _ = reply.send(Err(ConnError::Transport(err)));
        self.fail(ClientEvent::TransportError(reason))
    }

    async fn begin_disconnect(
        &mut self,
        link: &mut Link,
        phase: &mut Phase,
        headers: Vec<(String, String)>,
    ) -> Option<Exit> {
        match *phase {
            Phase::Handshake => Some(Exit::Planned),
            Phase::Closing { .. } => None,
            Phase::Open => {
                self.inner.set_state(ConnectionState::Disconnecting);
                let mut frame = Frame::new("DISCONNECT").headers(headers);
                let receipt_id = match frame.get_header("receipt") {
                    Some(id) => id.to_string(),
                    None => {
                        let id = link.session.next_receipt_id();
                        frame.headers.push(("receipt".to_string(), id.clone()));
                        id
                    }
                };
                if let Err(e) = link.send_frame(&frame, false).await {
                    debug!("DISCONNECT not sent: {}", e);
                    return Some(Exit::Planned);
                }
                *phase = Phase::Closing {
                    receipt_id,
                    deadline: deadline_after(self.inner.options.disconnect_timeout),
                };
                None
            }
        }
    }

    fn on_transport(
        &mut self,
        link: &mut Link,
        phase: &mut Phase,
        timers: &mut Timers,
        event: Result<TransportEvent, TransportError>,
    ) -> Option<Exit> {
        match event {
            Err(e) if phase.is_closing() => {
                debug!("transport error while disconnecting: {}", e);
                Some(Exit::Planned)
            }
            Err(e) => {
                warn!("transport error: {}", e);
                Some(self.fail(ClientEvent::TransportError(e.to_string())))
            }
            Ok(TransportEvent::Closed(_)) if phase.is_closing() => {
                debug!("transport closed while disconnecting");
                Some(Exit::Planned)
            }
            Ok(TransportEvent::Closed(info)) => {
                warn!(%info, "transport closed by peer");
                Some(self.fail(ClientEvent::TransportClosed(info)))
            }
            Ok(TransportEvent::Data(bytes)) => {
                link.session.mark_received(Instant::now());
                link.decoder.push(&bytes);
                loop {
                    match link.decoder.next_item() {
                        Ok(None) => return None,
                        Ok(Some(StompItem::Heartbeat)) => trace!("<<< heartbeat"),
                        Ok(Some(StompItem::Frame(frame))) => {
                            if let Some(exit) = self.on_frame(link, phase, timers, frame) {
                                return Some(exit);
                            }
                        }
                        Err(e) => {
                            error!("decode error: {}", e);
                            let event = ClientEvent::Error(ConnError::Decode(e));
                            return Some(self.abandon_in(phase, event));
                        }
                    }
                }
            }
        }
    }

    fn on_frame(
        &mut self,
        link: &mut Link,
        phase: &mut Phase,
        timers: &mut Timers,
        frame: Frame,
    ) -> Option<Exit> {
        debug!(command = %frame.command, "<<<");
        if matches!(phase, Phase::Handshake) {
            return match frame.command.as_str() {
                "CONNECTED" => self.on_connected(link, phase, timers, frame),
                "ERROR" => {
                    let err = ServerError::from_frame(frame);
                    error!("broker rejected CONNECT: {}", err);
                    Some(self.fail(ClientEvent::Error(ConnError::Server(err))))
                }
                _ => {
                    warn!(command = %frame.command, "frame before CONNECTED");
                    self.inner.emit(ClientEvent::UnhandledFrame(frame));
                    None
                }
            };
        }

        match link.session.dispatch(frame) {
            Ok(Dispatch::Delivered) | Ok(Dispatch::Dropped) => None,
            Ok(Dispatch::Receipt { id, matched }) => {
                trace!(receipt = %id, matched, "receipt");
                if let Phase::Closing { receipt_id, .. } = phase {
                    if *receipt_id == id {
                        info!("disconnected");
                        return Some(Exit::Planned);
                    }
                }
                self.inner.emit(ClientEvent::Receipt(id));
                None
            }
            Ok(Dispatch::ServerError(err)) => {
                error!("{}", err);
                Some(self.fail_in(phase, ClientEvent::Error(ConnError::Server(err))))
            }
            Ok(Dispatch::Unhandled(frame)) => {
                debug!(command = %frame.command, "unhandled frame");
                self.inner.emit(ClientEvent::UnhandledFrame(frame));
                None
            }
            Err(e) => {
                error!("{}", e);
                Some(self.fail_in(phase, ClientEvent::Error(e)))
            }
        }
    }

    fn on_connected(
        &mut self,
        link: &mut Link,
        phase: &mut Phase,
        timers: &mut Timers,
        frame: Frame,
    ) -> Option<Exit> {
        let options = &self.inner.options;
        let info = match link
            .session
            .on_connected(&frame, options.heartbeat, &options.accept_version)
        {
            Ok(info) => info,
            Err(e) => {
                error!("unusable CONNECTED frame: {}", e);
                return Some(self.fail(ClientEvent::Error(e)));
            }
        };
        link.decoder.set_version(info.version);
        *timers = Timers::start(info.heartbeat);
        *phase = Phase::Open;
        if self.backoff.attempts() > 0 {
            info!(attempts = self.backoff.attempts(), "reconnected");
        }
        self.backoff.reset();
        self.inner.attempts.store(0, Ordering::SeqCst);
        info!(
            version = %info.version,
            server = info.server.as_deref().unwrap_or("unknown"),
            "connected"
        );
        self.inner.set_state(ConnectionState::Connected);
        self.inner.emit(ClientEvent::Connected(info));
        None
    }

    fn on_incoming_tick(&self, link: &Link, phase: &Phase) -> Option<Exit> {
        let silent = link
            .session
            .incoming_overdue(Instant::now(), self.inner.options.heartbeat_tolerance)?;
        warn!(?silent, interval = ?link.session.heartbeat().incoming, "broker heartbeat missed");
        Some(self.fail_in(phase, ClientEvent::Error(ConnError::HeartbeatTimeout(silent))))
    }

    async fn on_outgoing_tick(&mut self, link: &mut Link) -> Option<Exit> {
        if !link.session.outgoing_tick() {
            return None;
        }
        trace!(">>> heartbeat");
        match link.transport.send(Bytes::from_static(HEARTBEAT)).await {
            Ok(()) => None,
            Err(e) => {
                warn!("heartbeat send failed: {}", e);
                Some(self.fail(ClientEvent::TransportError(e.to_string())))
            }
        }
    }
}
