use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Requested heart-beat intervals, as sent in the CONNECT `heart-beat`
/// header.
///
/// `send_ms` is how often this client promises to send something;
/// `receive_ms` is how often it wants to hear from the broker. Zero disables
/// that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub send_ms: u64,
    pub receive_ms: u64,
}

impl Heartbeat {
    pub fn new(send_ms: u64, receive_ms: u64) -> Self {
        Self {
            send_ms,
            receive_ms,
        }
    }

    /// No heartbeats in either direction.
    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    /// The same interval in both directions.
    pub fn from_duration(interval: Duration) -> Self {
        let ms = interval.as_millis() as u64;
        Self::new(ms, ms)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new(10_000, 10_000)
    }
}

impl fmt::Display for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.send_ms, self.receive_ms)
    }
}

impl FromStr for Heartbeat {
    type Err = std::convert::Infallible;

    /// Lenient: see [`parse_heartbeat_header`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (send_ms, receive_ms) = parse_heartbeat_header(s);
        Ok(Self::new(send_ms, receive_ms))
    }
}

/// Parse a `heart-beat` header value (format: "cx,cy").
///
/// Returns `(cx, cy)` in milliseconds. Missing or invalid fields default to
/// `0`; anything after the second field is ignored.
pub fn parse_heartbeat_header(header: &str) -> (u64, u64) {
    let mut parts = header.split(',');
    let cx = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let cy = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    (cx, cy)
}

/// Effective heartbeat intervals for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NegotiatedHeartbeat {
    /// How often this client must send (a frame or a heartbeat byte).
    pub outgoing: Option<Duration>,
    /// How often the broker is expected to send.
    pub incoming: Option<Duration>,
}

/// Negotiate heartbeat intervals between client and server.
///
/// - `client_out`/`client_in`: what this client asked for in CONNECT.
/// - `server_out`/`server_in`: the broker's CONNECTED `heart-beat` values.
///
/// A direction is disabled when either side puts 0 on it; otherwise the
/// interval is the larger of the two values.
///
/// | direction | client | server    | effective                          |
/// |-----------|--------|-----------|------------------------------------|
/// | outgoing  | cx     | sy        | 0 if cx==0 or sy==0, else max(cx,sy) |
/// | incoming  | cy     | sx        | 0 if cy==0 or sx==0, else max(cy,sx) |
pub fn negotiate_heartbeats(
    client_out: u64,
    client_in: u64,
    server_out: u64,
    server_in: u64,
) -> NegotiatedHeartbeat {
    let pick = |ours: u64, theirs: u64| {
        if ours == 0 || theirs == 0 {
            None
        } else {
            Some(Duration::from_millis(ours.max(theirs)))
        }
    };
    NegotiatedHeartbeat {
        outgoing: pick(client_out, server_in),
        incoming: pick(client_in, server_out),
    }
}
