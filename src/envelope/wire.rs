//! Wire envelope: `{event, method?, data, rid?, tid?, resolve?}`.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::{Protocol, Reply, Request, Resolution, DEFAULT_METHOD};

/// Request as it appears inside a frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WireRequest {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub rid: Option<String>,
    /// Kernel-issued task id (only on `/invokeAction` frames).
    #[serde(default)]
    pub tid: Option<String>,
    #[serde(default, rename = "resolve")]
    pub resolution: Option<Resolution>,
}

impl WireRequest {
    pub fn into_request(self, protocol: Protocol) -> Request {
        let method = self
            .method
            .filter(|m| !m.is_empty())
            .map(|m| m.to_ascii_uppercase())
            .unwrap_or_else(|| DEFAULT_METHOD.to_string());
        Request {
            method,
            body: self.data,
            rid: self.rid,
            resolution: self.resolution.unwrap_or_default(),
            ..Request::new(protocol, self.event)
        }
    }
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A fresh request carrying a non-empty `event`.
    Request(WireRequest),
    /// A reply to something this side issued, correlated by `rid`.
    Reply { rid: String, reply: Reply },
}

impl Frame {
    /// Classify a JSON value. Anything that is neither a request with a
    /// non-empty `event` nor a `rid`-tagged reply is noise and yields `None`.
    pub fn decode(value: Value) -> Option<Frame> {
        let Value::Object(mut map) = value else {
            return None;
        };
        if has_event(&map) {
            return serde_json::from_value(Value::Object(map))
                .ok()
                .map(Frame::Request);
        }
        if map.contains_key("event") {
            return None;
        }
        match map.remove("rid") {
            Some(Value::String(rid)) if !rid.is_empty() => Some(Frame::Reply {
                rid,
                reply: Reply::from_value(Value::Object(map)),
            }),
            _ => None,
        }
    }

    pub fn decode_slice(bytes: &[u8]) -> Option<Frame> {
        serde_json::from_slice::<Value>(bytes).ok().and_then(Frame::decode)
    }
}

fn has_event(map: &Map<String, Value>) -> bool {
    matches!(map.get("event"), Some(Value::String(event)) if !event.is_empty())
}
