//! Envelope - the transport-agnostic request.
//!
//! Every adapter turns its framing into a [`Request`], pairs it with the
//! connection's [`ReplySink`] and hands the resulting [`Envelope`] to the
//! kernel. Only the `Request` half is serializable; it is what crosses
//! process and node boundaries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::transport::ReplySink;

pub mod enums;
pub mod reply;
pub mod wire;

pub use enums::{Protocol, Resolution};
pub use reply::Reply;
pub use wire::{Frame, WireRequest};

/// Method assigned when the transport has no notion of one.
pub const DEFAULT_METHOD: &str = "POST";

/// Canonical request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub protocol: Protocol,
    pub method: String,
    /// Target path.
    pub event: String,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default)]
    pub resolution: Resolution,
}

impl Request {
    pub fn new(protocol: Protocol, event: impl Into<String>) -> Self {
        Self {
            protocol,
            method: DEFAULT_METHOD.to_string(),
            event: event.into(),
            body: Value::Null,
            query: HashMap::new(),
            params: HashMap::new(),
            remote_addr: None,
            host: None,
            rid: None,
            resolution: Resolution::Best,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into().to_ascii_uppercase();
        self
    }

    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_rid(mut self, rid: impl Into<String>) -> Self {
        self.rid = Some(rid.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }
}

/// A request bound to the channel its reply must travel back on.
#[derive(Clone)]
pub struct Envelope {
    pub request: Request,
    pub sink: Option<Arc<dyn ReplySink>>,
}

impl Envelope {
    pub fn new(request: Request, sink: Option<Arc<dyn ReplySink>>) -> Self {
        Self { request, sink }
    }

    /// Envelope with no reply channel (direct in-process calls).
    pub fn detached(request: Request) -> Self {
        Self {
            request,
            sink: None,
        }
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("request", &self.request)
            .field("sink", &self.sink.as_ref().map(|s| s.id().clone()))
            .finish()
    }
}
