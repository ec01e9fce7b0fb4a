//! In-process channel.
//!
//! Frames are `serde_json::Value`s handed over without serialization. The
//! kernel side is a [`ChannelSink`]; the other side pushes frames straight
//! into [`Kernel::accept_frame`]. Requests arriving this way are tagged
//! [`Protocol::Local`] and are trusted for the handshake.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{ChannelSink, Peer, ReplySink};
use crate::envelope::{Frame, Protocol};
use crate::kernel::Kernel;
use crate::types::SinkId;

/// Both directions of an in-process connection.
#[derive(Debug)]
pub struct LocalLink {
    sender: LocalSender,
    inbox: mpsc::UnboundedReceiver<Value>,
}

/// Sending half of a [`LocalLink`].
#[derive(Debug, Clone)]
pub struct LocalSender {
    kernel: Arc<Kernel>,
    sink: Arc<dyn ReplySink>,
    peer: Peer,
}

impl LocalLink {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        let (sink, inbox) = ChannelSink::new(Protocol::Local);
        Self {
            sender: LocalSender {
                kernel,
                sink: Arc::new(sink),
                peer: Peer::new(Protocol::Local),
            },
            inbox,
        }
    }

    /// Identity under which the kernel knows this link.
    pub fn sink_id(&self) -> &SinkId {
        self.sender.sink.id()
    }

    pub fn send(&self, frame: Value) {
        self.sender.send(frame);
    }

    /// Next frame the kernel pushed to this side.
    pub async fn recv(&mut self) -> Option<Value> {
        self.inbox.recv().await
    }

    pub fn into_parts(self) -> (LocalSender, mpsc::UnboundedReceiver<Value>) {
        (self.sender, self.inbox)
    }
}

impl LocalSender {
    /// Hand a frame to the kernel. Noise is dropped like on any adapter.
    pub fn send(&self, frame: Value) {
        match Frame::decode(frame) {
            Some(frame) => self.kernel.accept_frame(frame, &self.peer, self.sink.clone()),
            None => tracing::debug!("Dropping malformed local frame"),
        }
    }

    /// Tell the kernel this side is gone.
    pub fn close(&self) {
        self.kernel.sign_out(self.sink.id());
    }
}
