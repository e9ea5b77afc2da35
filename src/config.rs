use std::time::Duration;

use crate::heartbeat::Heartbeat;
use crate::parser::DEFAULT_MAX_FRAME_SIZE;
use crate::reconnect::ReconnectDelay;
use crate::version::VersionList;

const DEFAULT_HEARTBEAT_TOLERANCE: f64 = 2.0;
/// Upper bound accepted by [`ConnectOptions::heartbeat_tolerance`].
pub const MAX_HEARTBEAT_TOLERANCE: f64 = 100.0;

/// Options controlling the CONNECT handshake, liveness checking and
/// reconnection.
///
/// Built with chained setters:
///
/// ```
/// use std::time::Duration;
/// use stomp_relay::{ConnectOptions, Heartbeat};
///
/// let opts = ConnectOptions::default()
///     .login("guest", "guest")
///     .host("/")
///     .heartbeat(Heartbeat::new(4000, 4000))
///     .connect_timeout(Duration::from_secs(3));
/// assert_eq!(opts.heartbeat.to_string(), "4000,4000");
/// ```
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Versions offered in `accept-version`, most preferred first.
    pub accept_version: VersionList,
    /// Virtual host; "/" when unset.
    pub host: Option<String>,
    pub login: Option<String>,
    pub passcode: Option<String>,
    /// Extra CONNECT headers, sent after the standard ones.
    pub headers: Vec<(String, String)>,
    /// Requested heartbeat intervals.
    pub heartbeat: Heartbeat,
    /// Multiplier on the negotiated incoming interval before the peer is
    /// declared dead.
    pub heartbeat_tolerance: f64,
    /// Bound on opening the transport plus receiving CONNECTED.
    pub connect_timeout: Duration,
    /// Bound on waiting for the DISCONNECT receipt.
    pub disconnect_timeout: Duration,
    /// Reconnect after unplanned disconnects.
    pub reconnect: bool,
    pub reconnect_delay: ReconnectDelay,
    /// Largest frame accepted from the broker.
    pub max_frame_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            accept_version: VersionList::default(),
            host: None,
            login: None,
            passcode: None,
            headers: Vec::new(),
            heartbeat: Heartbeat::default(),
            heartbeat_tolerance: DEFAULT_HEARTBEAT_TOLERANCE,
            connect_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
            reconnect: true,
            reconnect_delay: ReconnectDelay::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept_version(mut self, versions: VersionList) -> Self {
        self.accept_version = versions;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn login(mut self, login: impl Into<String>, passcode: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self.passcode = Some(passcode.into());
        self
    }

    /// Add a custom CONNECT header (e.g. `client-id` for durable
    /// subscriptions on some brokers).
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Clamped to `1.0..=MAX_HEARTBEAT_TOLERANCE`; NaN keeps the default.
    pub fn heartbeat_tolerance(mut self, factor: f64) -> Self {
        self.heartbeat_tolerance = if factor.is_nan() {
            DEFAULT_HEARTBEAT_TOLERANCE
        } else {
            factor.clamp(1.0, MAX_HEARTBEAT_TOLERANCE)
        };
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.reconnect = enabled;
        self
    }

    pub fn reconnect_delay(mut self, delay: ReconnectDelay) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn max_frame_size(mut self, limit: usize) -> Self {
        self.max_frame_size = limit;
        self
    }

    /// Headers of the CONNECT frame, in wire order.
    pub(crate) fn connect_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            (
                "accept-version".to_string(),
                self.accept_version.accept_version_header(),
            ),
            (
                "host".to_string(),
                self.host.clone().unwrap_or_else(|| "/".to_string()),
            ),
        ];
        if let Some(login) = &self.login {
            headers.push(("login".to_string(), login.clone()));
        }
        if let Some(passcode) = &self.passcode {
            headers.push(("passcode".to_string(), passcode.clone()));
        }
        headers.push(("heart-beat".to_string(), self.heartbeat.to_string()));
        headers.extend(self.headers.iter().cloned());
        headers
    }
}
