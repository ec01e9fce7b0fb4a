//! UDP adapter. One JSON frame per datagram.
//!
//! A datagram may start with a PROXY v1 header; the announced source becomes
//! the caller's address while the reply still goes back to the sender. The
//! announced source is caller-controlled, so the logical host stays the
//! sender's IP.

use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::codec::strip_proxy_header;
use super::{Peer, ReplySink};
use crate::envelope::{Frame, Protocol};
use crate::kernel::Kernel;
use crate::types::{Error, Result, SinkId, TransportConfig};

#[derive(Debug)]
pub struct DatagramServer {
    socket: Arc<UdpSocket>,
    kernel: Arc<Kernel>,
    config: TransportConfig,
    cancel: CancellationToken,
}

impl DatagramServer {
    pub async fn bind(
        addr: &str,
        kernel: Arc<Kernel>,
        config: TransportConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            kernel,
            config,
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("UDP server listening on {}", self.local_addr()?);
        let mut buf = vec![0u8; self.config.max_frame_bytes.min(u16::MAX as usize)];

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("UDP server shutting down");
                    break;
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, sender) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            tracing::warn!("UDP receive failed: {}", e);
                            continue;
                        }
                    };
                    self.accept(&buf[..len], sender);
                }
            }
        }
        Ok(())
    }

    fn accept(&self, datagram: &[u8], sender: SocketAddr) {
        let (proxied, payload) = strip_proxy_header(datagram);
        let Some(frame) = Frame::decode_slice(payload) else {
            tracing::debug!("Dropping malformed datagram from {}", sender);
            return;
        };
        let mut peer = Peer::from_socket(Protocol::Udp, sender);
        if let Some(source) = proxied {
            peer.remote_addr = Some(source.to_string());
        }
        let sink: Arc<dyn ReplySink> = Arc::new(DatagramSink {
            id: SinkId::new(),
            socket: self.socket.clone(),
            target: sender,
        });
        self.kernel.accept_frame(frame, &peer, sink);
    }
}

/// Replies to one datagram's sender.
#[derive(Debug)]
struct DatagramSink {
    id: SinkId,
    socket: Arc<UdpSocket>,
    target: SocketAddr,
}

impl ReplySink for DatagramSink {
    fn id(&self) -> &SinkId {
        &self.id
    }

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn send(&self, frame: Value) -> Result<()> {
        let bytes = serde_json::to_vec(&frame)?;
        let socket = self.socket.clone();
        let target = self.target;
        tokio::runtime::Handle::try_current()
            .map_err(|_| Error::channel_closed("UDP socket has no runtime"))?
            .spawn(async move {
                if let Err(e) = socket.send_to(&bytes, target).await {
                    tracing::debug!("UDP reply to {} failed: {}", target, e);
                }
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{handler_fn, ExecutionMode, HandlerSpec};
    use crate::types::{KernelConfig, NodeId};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_proxy_source_becomes_remote_addr() {
        let kernel = Arc::new(Kernel::new(
            NodeId::from_string("k".to_string()).unwrap(),
            KernelConfig::default(),
        ));
        kernel
            .registry()
            .register(
                "t",
                HandlerSpec::new(
                    "whoami",
                    "/whoami",
                    handler_fn(|req: crate::envelope::Request| async move {
                        Ok(json!({"remote": req.remote_addr, "host": req.host}))
                    }),
                )
                .mode(ExecutionMode::Inline),
            )
            .unwrap();

        let cancel = CancellationToken::new();
        let server = DatagramServer::bind("127.0.0.1:0", kernel, TransportConfig::disabled(), cancel.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(
                b"PROXY UDP4 203.0.113.9 10.0.0.1 5555 3003\r\n{\"event\":\"/whoami\",\"rid\":\"d1\"}",
                addr,
            )
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, addr);
        let reply: Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(
            reply,
            json!({
                "success": true,
                "data": {"remote": "203.0.113.9:5555", "host": "127.0.0.1"},
                "rid": "d1",
            })
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_shakehand_over_udp_is_rejected() {
        let kernel = Arc::new(Kernel::new(
            NodeId::from_string("k".to_string()).unwrap(),
            KernelConfig {
                trusted_shakehand: vec!["198.51.100.7".to_string(), "127.0.0.1".to_string()],
                ..KernelConfig::default()
            },
        ));
        let cancel = CancellationToken::new();
        let server = DatagramServer::bind("127.0.0.1:0", kernel.clone(), TransportConfig::disabled(), cancel.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let frames: [&[u8]; 2] = [
            b"PROXY UDP4 198.51.100.7 10.0.0.1 5555 3003\r\n{\"event\":\"/synego/shakehand\",\"rid\":\"s1\",\"data\":{\"nid\":\"n1\",\"data\":{\"serviceList\":[]}}}",
            b"{\"event\":\"/synego/shakehand\",\"rid\":\"s2\",\"data\":{\"nid\":\"n2\",\"data\":{\"serviceList\":[]}}}",
        ];
        for (frame, rid) in frames.iter().zip(["s1", "s2"]) {
            client.send_to(frame, addr).await.unwrap();
            let mut buf = [0u8; 1024];
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let reply: Value = serde_json::from_slice(&buf[..len]).unwrap();
            assert_eq!(
                reply,
                json!({"success": false, "reason": crate::kernel::INVALID_SHAKEHAND_CHANNEL, "rid": rid})
            );
        }
        assert!(kernel.members().is_empty());
        cancel.cancel();
    }
}
