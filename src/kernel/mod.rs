//! Kernel - the routing core.
//!
//! The kernel owns the local handler registry and the member center. Every
//! adapter hands it decoded frames together with the reply sink of their
//! connection; the kernel routes each request in a fixed order:
//!
//! 1. system paths (`/synego/shakehand`),
//! 2. the local registry, if any local handler matches,
//! 3. the cluster.
//!
//! Replies to calls the kernel issued to worker nodes come back as
//! `rid`-tagged frames and are resumed through the member center.

use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cluster::MemberCenter;
use crate::envelope::reply::EMPTY_TARGET_PATH;
use crate::envelope::{Envelope, Frame, Protocol, Reply, Request};
use crate::registry::{Advertised, HandlerModule, HandlerRegistry};
use crate::transport::{self, LocalLink, Peer, ReplySink};
use crate::types::{ActionId, Config, KernelConfig, NodeId, Result, SinkId, TransportConfig};

/// Reserved path of the worker handshake.
pub const SHAKEHAND: &str = "/synego/shakehand";

pub const INVALID_SHAKEHAND_CHANNEL: &str = "Invalid Shakehand Channel";
pub const INVALID_SHAKEHAND_BODY: &str = "Invalid Shakehand Body";

/// Handshake body: `{nid, data: {serviceList}}`.
#[derive(Debug, Deserialize)]
struct ShakehandBody {
    #[serde(default)]
    nid: String,
    #[serde(default)]
    data: ShakehandData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShakehandData {
    #[serde(default)]
    service_list: Vec<Advertised>,
}

/// Routing core of a kernel node.
#[derive(Debug)]
pub struct Kernel {
    node_id: NodeId,
    config: KernelConfig,
    registry: HandlerRegistry,
    members: MemberCenter,
}

impl Kernel {
    pub fn new(node_id: NodeId, config: KernelConfig) -> Self {
        Self {
            registry: HandlerRegistry::new(&config),
            members: MemberCenter::new(config.task_timeout),
            node_id,
            config,
        }
    }

    /// Kernel with the identity and dispatch settings of `config`.
    pub fn from_config(config: &Config) -> Self {
        let node_id = config
            .node
            .id
            .clone()
            .and_then(|id| NodeId::from_string(id).ok())
            .unwrap_or_else(NodeId::for_process);
        Self::new(node_id, config.kernel.clone())
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn members(&self) -> &MemberCenter {
        &self.members
    }

    /// Load a handler module into the local registry.
    pub fn mount(&self, module: &dyn HandlerModule) -> Vec<ActionId> {
        self.registry.mount(module)
    }

    /// Route one envelope to its reply.
    pub async fn route(&self, envelope: Envelope) -> Reply {
        let request = &envelope.request;
        if request.event.is_empty() {
            return Reply::failure(403, EMPTY_TARGET_PATH);
        }
        if request.event == SHAKEHAND {
            return self.shakehand(envelope);
        }

        if self.registry.has_match(request) {
            self.registry.invoke(envelope.request).await
        } else {
            self.members.invoke(envelope.request).await
        }
    }

    /// Route a request that has no reply channel of its own.
    pub async fn call(&self, request: Request) -> Reply {
        self.route(Envelope::detached(request)).await
    }

    /// Entry point of every adapter: handle one inbound frame from `peer`.
    ///
    /// Requests are routed on their own task and answered through `sink`
    /// with the caller's `rid` echoed; replies resume a pending cluster call.
    pub fn accept_frame(self: &Arc<Self>, frame: Frame, peer: &Peer, sink: Arc<dyn ReplySink>) {
        match frame {
            Frame::Reply { rid, reply } => {
                if !self.resume(&rid, reply) {
                    tracing::debug!("Dropping reply {} from {}: nobody is waiting", rid, sink.id());
                }
            }
            Frame::Request(wire) => {
                let mut request = wire.into_request(peer.protocol);
                request.remote_addr = peer.remote_addr.clone();
                request.host = peer.host.clone();

                let kernel = self.clone();
                tokio::spawn(async move {
                    let rid = request.rid.clone();
                    let reply = kernel.route(Envelope::new(request, Some(sink.clone()))).await;
                    if let Err(e) = sink.send(reply.to_frame(rid.as_deref())) {
                        tracing::debug!("Reply not delivered: {}", e);
                    }
                });
            }
        }
    }

    /// Deliver a worker's reply to the cluster call waiting on `tid`.
    pub fn resume(&self, tid: &str, reply: Reply) -> bool {
        self.members.resume(tid, reply)
    }

    /// Forget everything bound to a closed connection.
    pub fn sign_out(&self, sink_id: &SinkId) {
        self.members.sign_out(sink_id);
    }

    /// Open an in-process channel to this kernel.
    pub fn attach_local(self: &Arc<Self>) -> LocalLink {
        LocalLink::new(self.clone())
    }

    /// Serve every transport enabled in `transports` until `cancel` fires.
    pub async fn serve(self: Arc<Self>, transports: &TransportConfig, cancel: CancellationToken) -> Result<()> {
        let tasks = transport::spawn_listeners(self.clone(), transports, cancel.clone()).await?;
        tracing::info!("Kernel {} serving {} transport(s)", self.node_id, tasks.len());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Listener task failed: {}", e);
            }
        }
        Ok(())
    }

    fn shakehand(&self, envelope: Envelope) -> Reply {
        let Envelope { request, sink } = envelope;
        let reject = |reason: &str| Reply::Ack(json!({ "success": false, "reason": reason }));

        let Some(sink) = sink else {
            tracing::warn!("Shakehand without a reply channel rejected");
            return reject(INVALID_SHAKEHAND_CHANNEL);
        };
        // A member lives as long as its connection; datagrams have none.
        if request.protocol == Protocol::Udp {
            tracing::warn!("Shakehand over udp from {:?} rejected", request.remote_addr);
            return reject(INVALID_SHAKEHAND_CHANNEL);
        }
        if !self.is_trusted(&request) {
            tracing::warn!(
                "Shakehand from untrusted host {:?} over {} rejected",
                request.host,
                request.protocol
            );
            return reject(INVALID_SHAKEHAND_CHANNEL);
        }

        let body: ShakehandBody = match serde_json::from_value(request.body) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Malformed shakehand body: {}", e);
                return reject(INVALID_SHAKEHAND_BODY);
            }
        };
        let Ok(nid) = NodeId::from_string(body.nid) else {
            tracing::warn!("Shakehand without node id rejected");
            return reject(INVALID_SHAKEHAND_CHANNEL);
        };

        self.members.shakehand(nid, body.data.service_list, sink);
        Reply::Ack(json!({ "success": true, "nodeID": self.node_id }))
    }

    fn is_trusted(&self, request: &Request) -> bool {
        if request.protocol == Protocol::Local {
            return true;
        }
        request
            .host
            .as_deref()
            .is_some_and(|host| self.config.trusted_shakehand.iter().any(|t| t == host))
    }
}
