//! Envelope enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Tcp,
    Udp,
    /// Unix domain socket between processes on the same host.
    Ipc,
    Ws,
    Grpc,
    /// In-process channel; implicitly trusted.
    Local,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Ipc => "ipc",
            Protocol::Ws => "ws",
            Protocol::Grpc => "grpc",
            Protocol::Local => "local",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a request is resolved against several matching handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Only the most specific handler runs.
    #[default]
    Best,
    /// Handlers run least specific first until one returns a non-error reply.
    Chain,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_wire_names() {
        assert_eq!(serde_json::to_string(&Protocol::Ws).unwrap(), "\"ws\"");
        let p: Protocol = serde_json::from_str("\"grpc\"").unwrap();
        assert_eq!(p, Protocol::Grpc);
        assert_eq!(Protocol::Ipc.to_string(), "ipc");
    }

    #[test]
    fn test_resolution_defaults_to_best() {
        assert_eq!(Resolution::default(), Resolution::Best);
        let r: Resolution = serde_json::from_str("\"chain\"").unwrap();
        assert_eq!(r, Resolution::Chain);
    }
}
