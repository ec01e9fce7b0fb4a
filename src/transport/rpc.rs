//! gRPC gateway: a single unary `Dispatch` call carrying the JSON wire
//! request in, and the JSON reply out.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::TcpIncoming;
use tonic::{Request, Response, Status};

use crate::envelope::{Envelope, Protocol, Reply, WireRequest};
use crate::kernel::Kernel;
use crate::types::{Error, Result};

include!(concat!(env!("OUT_DIR"), "/synego.Gateway.rs"));

pub use gateway_client::GatewayClient;
pub use gateway_server::{Gateway, GatewayServer};

/// Wire request as JSON text.
#[derive(Clone, PartialEq, prost::Message)]
pub struct EnvelopeRequest {
    #[prost(string, tag = "1")]
    pub data: String,
}

/// Reply object as JSON text.
#[derive(Clone, PartialEq, prost::Message)]
pub struct EnvelopeReply {
    #[prost(string, tag = "1")]
    pub reply: String,
}

/// Gateway service backed by the kernel.
#[derive(Debug, Clone)]
pub struct GatewayService {
    kernel: Arc<Kernel>,
}

impl GatewayService {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }
}

#[tonic::async_trait]
impl Gateway for GatewayService {
    async fn dispatch(&self, request: Request<EnvelopeRequest>) -> std::result::Result<Response<EnvelopeReply>, Status> {
        let remote = request.remote_addr();
        let wire: WireRequest = match serde_json::from_str(&request.into_inner().data) {
            Ok(wire) => wire,
            Err(e) => {
                let err = Error::validation(format!("invalid request: {}", e));
                return Ok(Response::new(encode_reply(&Reply::from_error(&err), None)?));
            }
        };

        let rid = wire.rid.clone();
        let mut req = wire.into_request(Protocol::Grpc);
        if let Some(addr) = remote {
            req.remote_addr = Some(addr.to_string());
            req.host = Some(addr.ip().to_string());
        }
        tracing::debug!("gRPC dispatch {} {}", req.method, req.event);

        let reply = self.kernel.route(Envelope::detached(req)).await;
        Ok(Response::new(encode_reply(&reply, rid.as_deref())?))
    }
}

fn encode_reply(reply: &Reply, rid: Option<&str>) -> std::result::Result<EnvelopeReply, Status> {
    serde_json::to_string(&reply.to_frame(rid))
        .map(|reply| EnvelopeReply { reply })
        .map_err(|e| Status::from(Error::from(e)))
}

#[derive(Debug)]
pub struct RpcServer {
    listener: TcpListener,
    kernel: Arc<Kernel>,
    cancel: CancellationToken,
}

impl RpcServer {
    pub async fn bind(addr: &str, kernel: Arc<Kernel>, cancel: CancellationToken) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            kernel,
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<()> {
        let addr = self.local_addr()?;
        let incoming = TcpIncoming::from_listener(self.listener, true, None)
            .map_err(|e| Error::internal(format!("gRPC listener on {}: {}", addr, e)))?;
        tracing::info!("gRPC server listening on {}", addr);

        let cancel = self.cancel.clone();
        tonic::transport::Server::builder()
            .add_service(GatewayServer::new(GatewayService::new(self.kernel)))
            .serve_with_incoming_shutdown(incoming, async move { cancel.cancelled().await })
            .await
            .map_err(|e| Error::internal(format!("gRPC server failed: {}", e)))?;

        tracing::info!("gRPC server shutting down");
        Ok(())
    }
}
