//! Framing helpers shared by the adapters.
//!
//! Stream transports (TCP, Unix socket) use newline-delimited JSON:
//! ```text
//! {"event":"/echo","rid":"r1","data":"x"}\n
//! {"success":true,"data":"x","rid":"r1"}\n
//! ```
//! There is no length prefix, so a payload must never contain a literal
//! newline; `serde_json` escapes newlines inside strings, which makes every
//! encoded value newline-safe.
//!
//! Datagrams may be prefixed by a PROXY protocol v1 header
//! (`PROXY TCP4 <src> <dst> <sport> <dport>\r\n`) which is stripped before
//! parsing and yields the true source address.

use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use tokio_util::codec::LinesCodec;

use crate::types::Result;

/// Sentinel keepalive frames on persistent message sockets.
pub const HEARTBEAT_PING: &str = "heartbeat_ping";
pub const HEARTBEAT_PONG: &str = "heartbeat_pong";

const PROXY_PREFIX: &[u8] = b"PROXY ";
const PROXY_TERMINATOR: &[u8] = b"\r\n";
/// PROXY v1 headers are at most 107 bytes including CRLF.
const PROXY_MAX_HEADER: usize = 107;

/// Line codec bounded by the configured frame size.
pub fn line_codec(max_frame_bytes: usize) -> LinesCodec {
    LinesCodec::new_with_max_length(max_frame_bytes)
}

/// Encode one frame as a single line (without the trailing newline, which
/// the codec appends).
pub fn encode_line(frame: &Value) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}

/// Split an optional PROXY v1 header off a datagram.
///
/// Returns the source address announced by the header (if any) and the
/// remaining payload. Input without a well-formed header is returned as is.
pub fn strip_proxy_header(datagram: &[u8]) -> (Option<SocketAddr>, &[u8]) {
    if !datagram.starts_with(PROXY_PREFIX) {
        return (None, datagram);
    }
    let window = &datagram[..datagram.len().min(PROXY_MAX_HEADER)];
    let Some(end) = window
        .windows(PROXY_TERMINATOR.len())
        .position(|w| w == PROXY_TERMINATOR)
    else {
        return (None, datagram);
    };

    let payload = &datagram[end + PROXY_TERMINATOR.len()..];
    let header = String::from_utf8_lossy(&datagram[..end]);
    let fields: Vec<&str> = header.split_ascii_whitespace().collect();
    let source = match fields.as_slice() {
        ["PROXY", "TCP4" | "TCP6" | "UDP4" | "UDP6", src, _dst, sport, _dport] => {
            match (src.parse::<IpAddr>(), sport.parse::<u16>()) {
                (Ok(ip), Ok(port)) => Some(SocketAddr::new(ip, port)),
                _ => None,
            }
        }
        _ => None,
    };
    (source, payload)
}
