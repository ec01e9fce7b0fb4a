//! Worker node: joins a kernel and serves the calls it is handed.
//!
//! A worker loads handler modules into its own registry, connects to the
//! kernel over the cheapest channel available, announces its services with
//! `/synego/shakehand` and then answers `/invokeAction` frames by action id.

use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod link;

use link::{Link, Outbound};

use crate::cluster::INVOKE_ACTION;
use crate::correlation::CorrelationTable;
use crate::envelope::{Frame, Reply, Request};
use crate::kernel::{Kernel, SHAKEHAND};
use crate::registry::{HandlerModule, HandlerRegistry};
use crate::types::{local_ip, ActionId, Config, Error, KernelConfig, MasterConfig, NodeId, Result, TransportConfig, WorkerConfig};

pub const INVALID_KERNEL_CONNECTION: &str = "Invalid Kernel Connection Configuration";

/// Hosts that mean "this machine".
const LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1", "0.0.0.0", "::"];

/// How a worker reaches its kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelChannel {
    /// Same process.
    Local,
    /// Same host, different process.
    Unix(PathBuf),
    /// Another host.
    WebSocket(String),
}

impl KernelChannel {
    /// Pick the cheapest channel: in-process, then Unix socket, then
    /// WebSocket.
    pub fn choose(in_process: bool, master: &MasterConfig) -> Result<Self> {
        if in_process {
            return Ok(KernelChannel::Local);
        }
        if master.host.is_empty() {
            return Err(Error::validation("Invalid Config File: master.host is required"));
        }

        let same_host = LOCAL_HOSTS.contains(&master.host.as_str()) || master.host == local_ip();
        if same_host {
            if let Some(path) = &master.ipc {
                return Ok(KernelChannel::Unix(path.clone()));
            }
        }
        match master.ws {
            Some(port) => Ok(KernelChannel::WebSocket(ws_url(&master.host, port))),
            None => Err(Error::validation(INVALID_KERNEL_CONNECTION)),
        }
    }
}

fn ws_url(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("ws://[{}]:{}", host, port)
    } else {
        format!("ws://{}:{}", host, port)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvokeBody {
    action_path: String,
    request: Request,
}

/// A worker that has not joined a kernel yet.
#[derive(Debug)]
pub struct WorkerNode {
    node_id: NodeId,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    max_frame_bytes: usize,
}

impl WorkerNode {
    pub fn new(node_id: NodeId, kernel_config: &KernelConfig, config: WorkerConfig) -> Self {
        Self {
            node_id,
            registry: Arc::new(HandlerRegistry::new(kernel_config)),
            config,
            max_frame_bytes: TransportConfig::default().max_frame_bytes,
        }
    }

    /// Largest frame accepted from the kernel on socket links.
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn from_config(config: &Config) -> Self {
        let node_id = config
            .node
            .id
            .clone()
            .and_then(|id| NodeId::from_string(id).ok())
            .unwrap_or_else(NodeId::for_process);
        Self::new(node_id, &config.kernel, config.worker.clone())
            .with_max_frame_bytes(config.transports.max_frame_bytes)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn mount(&self, module: &dyn HandlerModule) -> Vec<ActionId> {
        self.registry.mount(module)
    }

    /// Connect and complete the handshake. `kernel` selects the in-process
    /// channel when the kernel lives in this process.
    pub async fn join(self, kernel: Option<Arc<Kernel>>) -> Result<NodeHandle> {
        let channel = KernelChannel::choose(kernel.is_some(), &self.config.master)?;
        let cancel = CancellationToken::new();
        let link = match (&channel, kernel) {
            (KernelChannel::Local, Some(kernel)) => {
                let (sender, inbound) = kernel.attach_local().into_parts();
                Link {
                    outbound: Outbound::Local(sender),
                    inbound,
                }
            }
            (KernelChannel::Unix(path), _) => {
                link::open_unix(path, self.max_frame_bytes, cancel.clone()).await?
            }
            (KernelChannel::WebSocket(url), _) => {
                link::open_ws(url, self.config.heartbeat_interval, self.max_frame_bytes, cancel.clone()).await?
            }
            (KernelChannel::Local, None) => return Err(Error::validation(INVALID_KERNEL_CONNECTION)),
        };
        tracing::info!("Service node {} joining kernel over {:?}", self.node_id, channel);

        let Link { outbound, inbound } = link;
        let calls = CorrelationTable::new("worker", self.config.shakehand_timeout);
        let task = tokio::spawn(serve_kernel(
            self.registry.clone(),
            outbound.clone(),
            inbound,
            calls.clone(),
            cancel.clone(),
        ));

        let handle = NodeHandle {
            node_id: self.node_id,
            registry: self.registry,
            channel,
            outbound,
            cancel,
            task,
        };
        match handle.shakehand(&calls).await {
            Ok(kernel_id) => {
                tracing::info!("Service node {} registered with kernel {}", handle.node_id, kernel_id);
                Ok(handle)
            }
            Err(e) => {
                handle.shutdown().await;
                Err(e)
            }
        }
    }
}

/// A worker that joined a kernel.
#[derive(Debug)]
pub struct NodeHandle {
    node_id: NodeId,
    registry: Arc<HandlerRegistry>,
    channel: KernelChannel,
    outbound: Outbound,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl NodeHandle {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn channel(&self) -> &KernelChannel {
        &self.channel
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Serve until `stop` fires (then leave the cluster) or the kernel link
    /// closes.
    pub async fn run_until(mut self, stop: CancellationToken) {
        let stopped = tokio::select! {
            _ = stop.cancelled() => true,
            _ = &mut self.task => false,
        };
        if stopped {
            self.shutdown().await;
        } else {
            tracing::warn!("Service node {} lost its kernel link", self.node_id);
        }
    }

    /// Leave the cluster.
    pub async fn shutdown(self) {
        self.outbound.close();
        self.cancel.cancel();
        let _ = self.task.await;
        tracing::info!("Service node {} stopped", self.node_id);
    }

    /// Announce the service list; returns the kernel's node id.
    async fn shakehand(&self, calls: &CorrelationTable<Reply>) -> Result<String> {
        let pending = calls.issue("kernel");
        self.outbound.send(json!({
            "event": SHAKEHAND,
            "rid": pending.id(),
            "data": {
                "nid": self.node_id,
                "data": { "serviceList": self.registry.list_advertised() },
            },
        }))?;

        let ack = match pending.wait().await? {
            Reply::Ack(ack) => ack,
            Reply::Success(data) => data,
            Reply::Failure { code, error } => return Err(Error::remote(code, error)),
        };
        tracing::debug!("Shakehand acknowledged: {}", ack);
        if ack.get("success").and_then(Value::as_bool) == Some(true) {
            Ok(ack
                .get("nodeID")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string())
        } else {
            let reason = ack.get("reason").and_then(Value::as_str).unwrap_or("rejected");
            Err(Error::forbidden(format!("Shakehand refused: {}", reason)))
        }
    }
}

/// Inbound loop: resume the node's own calls and serve `/invokeAction`.
async fn serve_kernel(
    registry: Arc<HandlerRegistry>,
    outbound: Outbound,
    mut inbound: mpsc::UnboundedReceiver<Value>,
    calls: CorrelationTable<Reply>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        match Frame::decode(frame) {
            Some(Frame::Reply { rid, reply }) => {
                if !calls.resolve(&rid, reply) {
                    tracing::debug!("Dropping reply {}: nobody is waiting", rid);
                }
            }
            Some(Frame::Request(wire)) if wire.event == INVOKE_ACTION => {
                let Some(tid) = wire.tid else {
                    tracing::warn!("Dropping {} without task id", INVOKE_ACTION);
                    continue;
                };
                let registry = registry.clone();
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let reply = match serde_json::from_value::<InvokeBody>(wire.data) {
                        Ok(body) => registry.invoke_action(&body.action_path, body.request).await,
                        Err(e) => Reply::failure(400, format!("Invalid {} body: {}", INVOKE_ACTION, e)),
                    };
                    if let Err(e) = outbound.send(reply.to_frame(Some(&tid))) {
                        tracing::warn!("Reply to task {} not delivered: {}", tid, e);
                    }
                });
            }
            Some(Frame::Request(wire)) => {
                tracing::debug!("Received {} from kernel, ignoring", wire.event);
            }
            None => tracing::debug!("Dropping malformed frame from kernel"),
        }
    }
    calls.reject_owner("kernel", "connection with kernel closed");
}

/// Start `n` in-process worker nodes, each with its own registry and the
/// given modules mounted.
pub async fn spawn_local_workers(
    kernel: &Arc<Kernel>,
    n: usize,
    modules: &[Arc<dyn HandlerModule>],
    kernel_config: &KernelConfig,
) -> Result<Vec<NodeHandle>> {
    let base = NodeId::for_process();
    let mut nodes = Vec::with_capacity(n);
    for i in 0..n {
        let node_id = NodeId::from_string(format!("{}#{}", base, i + 1)).map_err(Error::validation)?;
        let worker = WorkerNode::new(node_id, kernel_config, WorkerConfig::default());
        for module in modules {
            worker.mount(module.as_ref());
        }
        nodes.push(worker.join(Some(kernel.clone())).await?);
    }
    tracing::info!("{} local worker node(s) joined kernel {}", n, kernel.node_id());
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Protocol;
    use crate::registry::{handler_fn, ExecutionMode, HandlerSpec};
    use pretty_assertions::assert_eq;

    struct Upper;

    impl HandlerModule for Upper {
        fn module_id(&self) -> &str {
            "text"
        }

        fn handlers(&self) -> Vec<HandlerSpec> {
            vec![HandlerSpec::new(
                "upper",
                "/text/upper",
                handler_fn(|req: Request| async move {
                    Ok(json!(req.body.as_str().unwrap_or_default().to_uppercase()))
                }),
            )
            .mode(ExecutionMode::Inline)]
        }
    }

    fn master(host: &str, ws: Option<u16>, ipc: Option<&str>) -> MasterConfig {
        MasterConfig {
            host: host.to_string(),
            ws,
            ipc: ipc.map(PathBuf::from),
        }
    }

    #[test]
    fn test_channel_choice() {
        let sock = Some("/tmp/k.sock");
        assert_eq!(KernelChannel::choose(true, &master("10.9.9.9", None, None)).unwrap(), KernelChannel::Local);
        assert_eq!(
            KernelChannel::choose(false, &master("127.0.0.1", Some(3005), sock)).unwrap(),
            KernelChannel::Unix(PathBuf::from("/tmp/k.sock"))
        );
        assert_eq!(
            KernelChannel::choose(false, &master("localhost", Some(3005), None)).unwrap(),
            KernelChannel::WebSocket("ws://localhost:3005".to_string())
        );
        assert_eq!(
            KernelChannel::choose(false, &master("10.9.9.9", Some(3005), sock)).unwrap(),
            KernelChannel::WebSocket("ws://10.9.9.9:3005".to_string())
        );
        let err = KernelChannel::choose(false, &master("10.9.9.9", None, sock)).unwrap_err();
        assert!(err.to_string().contains(INVALID_KERNEL_CONNECTION));
    }

    #[tokio::test]
    async fn test_local_worker_serves_cluster_calls() {
        let kernel = Arc::new(Kernel::new(
            NodeId::from_string("kernel".to_string()).unwrap(),
            KernelConfig::default(),
        ));
        let modules: Vec<Arc<dyn HandlerModule>> = vec![Arc::new(Upper)];
        let nodes = spawn_local_workers(&kernel, 2, &modules, &KernelConfig::default())
            .await
            .unwrap();
        assert_eq!(kernel.members().len(), 2);
        assert_eq!(nodes[0].channel(), &KernelChannel::Local);

        let reply = kernel
            .call(Request::new(Protocol::Tcp, "/text/upper").with_body("abc"))
            .await;
        assert_eq!(reply, Reply::success("ABC"));

        for node in nodes {
            node.shutdown().await;
        }
        assert!(kernel.members().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_action_is_not_found() {
        let kernel = Arc::new(Kernel::new(
            NodeId::from_string("kernel".to_string()).unwrap(),
            KernelConfig::default(),
        ));
        let worker = WorkerNode::new(
            NodeId::from_string("w".to_string()).unwrap(),
            &KernelConfig::default(),
            WorkerConfig::default(),
        );
        let node = worker.join(Some(kernel.clone())).await.unwrap();
        let reply = node
            .registry()
            .invoke_action("nope::missing", Request::new(Protocol::Local, "/x"))
            .await;
        assert_eq!(reply.code(), Some(404));
        node.shutdown().await;
    }
}
