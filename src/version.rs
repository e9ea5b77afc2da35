use std::fmt;
use std::str::FromStr;

/// STOMP protocol versions understood by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    V1_0,
    V1_1,
    V1_2,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::V1_0 => "1.0",
            Version::V1_1 => "1.1",
            Version::V1_2 => "1.2",
        }
    }

    /// Whether header keys and values are escaped on the wire.
    pub fn escapes_headers(&self) -> bool {
        *self >= Version::V1_1
    }

    /// WebSocket subprotocol name advertised for this version.
    pub fn websocket_protocol(&self) -> &'static str {
        match self {
            Version::V1_0 => "v10.stomp",
            Version::V1_1 => "v11.stomp",
            Version::V1_2 => "v12.stomp",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1.0" => Ok(Version::V1_0),
            "1.1" => Ok(Version::V1_1),
            "1.2" => Ok(Version::V1_2),
            other => Err(format!("unsupported STOMP version '{}'", other)),
        }
    }
}

/// Ordered list of versions offered in CONNECT, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionList(Vec<Version>);

impl VersionList {
    pub fn new(versions: impl IntoIterator<Item = Version>) -> Self {
        let mut list: Vec<Version> = Vec::new();
        for v in versions {
            if !list.contains(&v) {
                list.push(v);
            }
        }
        Self(list)
    }

    pub fn versions(&self) -> &[Version] {
        &self.0
    }

    pub fn contains(&self, version: Version) -> bool {
        self.0.contains(&version)
    }

    /// Value for the `accept-version` CONNECT header, e.g. "1.2,1.1,1.0".
    pub fn accept_version_header(&self) -> String {
        self.0
            .iter()
            .map(Version::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// WebSocket subprotocols matching the offered versions, in order.
    pub fn websocket_protocols(&self) -> Vec<&'static str> {
        self.0.iter().map(Version::websocket_protocol).collect()
    }
}

impl Default for VersionList {
    fn default() -> Self {
        Self(vec![Version::V1_2, Version::V1_1, Version::V1_0])
    }
}
