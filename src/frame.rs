use std::fmt;

/// A STOMP frame as it travels on the wire.
///
/// `Frame` holds the command (e.g. "SEND", "MESSAGE"), the headers in the
/// order they were written or received, and the raw body bytes. Header keys
/// are not required to be unique: repeated keys are all retained and the
/// first occurrence is the authoritative one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// STOMP command (e.g. CONNECT, SEND, SUBSCRIBE)
    pub command: String,
    /// Ordered headers as (key, value) pairs, duplicates preserved
    pub headers: Vec<(String, String)>,
    /// Raw body bytes; may contain NUL when the frame carries `content-length`
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a new frame with the given command and empty headers/body.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Add a header (builder style). Existing headers with the same key are
    /// kept; lookups return the first one.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Append every header from `headers` in order (builder style).
    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Set the frame body (builder style).
    pub fn set_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Request a RECEIPT for this frame (builder style).
    pub fn receipt(self, receipt_id: impl Into<String>) -> Self {
        self.header("receipt", receipt_id)
    }

    /// Get the value of a header by name.
    ///
    /// Returns the first header value matching the given key (case-sensitive),
    /// or `None` if no such header exists.
    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value recorded for `key`, in wire order.
    pub fn get_all_headers<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether at least one header named `key` is present.
    pub fn has_header(&self, key: &str) -> bool {
        self.headers.iter().any(|(k, _)| k == key)
    }

    /// Remove every header named `key`.
    pub fn remove_header(&mut self, key: &str) {
        self.headers.retain(|(k, _)| k != key);
    }

    /// The body as UTF-8 text, if it is valid UTF-8.
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// The first `content-length` header, parsed. `None` when absent or not a
    /// non-negative integer.
    pub fn content_length(&self) -> Option<usize> {
        self.get_header("content-length")
            .map(str::trim)
            .filter(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|v| v.parse::<usize>().ok())
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Command: {}", self.command)?;
        for (k, v) in &self.headers {
            writeln!(f, "{}: {}", k, v)?;
        }
        writeln!(f, "Body ({} bytes)", self.body.len())
    }
}
