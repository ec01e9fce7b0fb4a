//! Transport adapters.
//!
//! Every adapter decodes its framing into a [`Frame`](crate::envelope::Frame),
//! binds a [`ReplySink`] to the connection and hands both to the kernel. The
//! dispatch core only ever sees the sink capability, never a socket.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::envelope::Protocol;
use crate::kernel::Kernel;
use crate::types::{Error, Result, SinkId, TransportConfig};

pub mod codec;
pub mod datagram;
pub mod http;
pub mod local;
pub mod rpc;
pub mod stream;
pub mod websocket;

pub use datagram::DatagramServer;
pub use http::HttpServer;
pub use local::{LocalLink, LocalSender};
pub use rpc::RpcServer;
pub use stream::{TcpServer, UnixServer};
pub use websocket::WsServer;

/// Capability to push a frame back over the channel a request arrived on.
pub trait ReplySink: fmt::Debug + Send + Sync {
    /// Identity of the underlying connection, used for clean-up on disconnect.
    fn id(&self) -> &SinkId;

    fn protocol(&self) -> Protocol;

    fn send(&self, frame: Value) -> Result<()>;
}

/// Sink backed by the outbound queue of a connection's writer task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    id: SinkId,
    protocol: Protocol,
    tx: mpsc::UnboundedSender<Value>,
}

impl ChannelSink {
    pub fn new(protocol: Protocol) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            id: SinkId::new(),
            protocol,
            tx,
        };
        (sink, rx)
    }
}

impl ReplySink for ChannelSink {
    fn id(&self) -> &SinkId {
        &self.id
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn send(&self, frame: Value) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| Error::channel_closed(format!("{} connection {} closed", self.protocol, self.id)))
    }
}

/// Where a connection comes from.
#[derive(Debug, Clone)]
pub struct Peer {
    pub protocol: Protocol,
    pub remote_addr: Option<String>,
    /// Logical host (Host header, or the peer IP when there is none).
    pub host: Option<String>,
}

impl Peer {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            remote_addr: None,
            host: None,
        }
    }

    pub fn from_socket(protocol: Protocol, addr: std::net::SocketAddr) -> Self {
        Self {
            protocol,
            remote_addr: Some(addr.to_string()),
            host: Some(addr.ip().to_string()),
        }
    }
}

/// Hostname part of a `Host` header value.
pub(crate) fn host_name(header: &str) -> &str {
    if let Some(rest) = header.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match header.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => header,
    }
}

/// Start every listener enabled in `config`. Each runs until `cancel` fires.
pub async fn spawn_listeners(
    kernel: Arc<Kernel>,
    config: &TransportConfig,
    cancel: CancellationToken,
) -> Result<Vec<JoinHandle<()>>> {
    let mut tasks = Vec::new();

    if let Some(addr) = &config.tcp {
        let server = TcpServer::bind(addr, kernel.clone(), config.clone(), cancel.clone()).await?;
        tasks.push(tokio::spawn(async move { log_exit("tcp", server.serve().await) }));
    }
    if let Some(path) = &config.ipc {
        let server = UnixServer::bind(path, kernel.clone(), config.clone(), cancel.clone())?;
        tasks.push(tokio::spawn(async move { log_exit("ipc", server.serve().await) }));
    }
    if let Some(addr) = &config.udp {
        let server = DatagramServer::bind(addr, kernel.clone(), config.clone(), cancel.clone()).await?;
        tasks.push(tokio::spawn(async move { log_exit("udp", server.serve().await) }));
    }
    if let Some(addr) = &config.ws {
        let server = WsServer::bind(addr, kernel.clone(), config.clone(), cancel.clone()).await?;
        tasks.push(tokio::spawn(async move { log_exit("ws", server.serve().await) }));
    }
    if let Some(addr) = &config.grpc {
        let server = RpcServer::bind(addr, kernel.clone(), cancel.clone()).await?;
        tasks.push(tokio::spawn(async move { log_exit("grpc", server.serve().await) }));
    }
    if let Some(addr) = &config.http {
        let server = HttpServer::bind(addr, kernel.clone(), cancel.clone()).await?;
        tasks.push(tokio::spawn(async move { log_exit("http", server.serve().await) }));
    }

    Ok(tasks)
}

fn log_exit(name: &str, result: Result<()>) {
    match result {
        Ok(()) => tracing::info!("{} listener stopped", name),
        Err(e) => tracing::error!("{} listener failed: {}", name, e),
    }
}
