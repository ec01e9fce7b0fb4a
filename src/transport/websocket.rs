//! WebSocket adapter. One JSON frame per text (or binary) message.
//!
//! Persistent links are kept alive with `heartbeat_ping` / `heartbeat_pong`
//! text messages; a ping is answered, a pong is ignored.
//!
//! The logical host of a connection is the handshake's `Host` header, which
//! the client chooses. Shakehand trust over this transport is only as strong
//! as that header: list hosts in `trusted_shakehand` only when the listener
//! sits behind a proxy that sets `Host` itself.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::codec::{encode_line, HEARTBEAT_PING, HEARTBEAT_PONG};
use super::{host_name, ChannelSink, Peer, ReplySink};
use crate::envelope::{Frame, Protocol};
use crate::kernel::Kernel;
use crate::types::{Result, TransportConfig};

/// WebSocket listener. Peers get the `Host` header as their logical host.
#[derive(Debug)]
pub struct WsServer {
    listener: TcpListener,
    kernel: Arc<Kernel>,
    config: TransportConfig,
    cancel: CancellationToken,
}

impl WsServer {
    pub async fn bind(
        addr: &str,
        kernel: Arc<Kernel>,
        config: TransportConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            kernel,
            config,
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<()> {
        let limit = Arc::new(Semaphore::new(self.config.max_connections));
        tracing::info!(
            "WebSocket server listening on {} (max_connections={})",
            self.local_addr()?,
            self.config.max_connections,
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("WebSocket server shutting down");
                    break;
                }
                accept = self.listener.accept() => {
                    let (stream, addr) = match accept {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("WebSocket accept failed: {}", e);
                            continue;
                        }
                    };
                    let permit = match limit.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                "Connection from {} rejected: at max_connections ({})",
                                addr,
                                self.config.max_connections,
                            );
                            continue;
                        }
                    };
                    tokio::spawn(handle_connection(
                        stream,
                        addr,
                        self.kernel.clone(),
                        self.config.clone(),
                        self.cancel.clone(),
                        permit,
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Message size limits for both ends of a link.
pub(crate) fn ws_config(max_frame_bytes: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_frame_bytes);
    config.max_frame_size = Some(max_frame_bytes);
    config
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    kernel: Arc<Kernel>,
    config: TransportConfig,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let mut host_header: Option<String> = None;
    let capture_host = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        host_header = request
            .headers()
            .get("host")
            .and_then(|v| v.to_str().ok())
            .map(|h| host_name(h).to_string());
        Ok(response)
    };
    let ws = match tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        capture_host,
        Some(ws_config(config.max_frame_bytes)),
    )
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let mut peer = Peer::from_socket(Protocol::Ws, addr);
    if host_header.is_some() {
        peer.host = host_header;
    }

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (sink, mut outbound) = ChannelSink::new(Protocol::Ws);
    let sink_id = sink.id().clone();
    let sink: Arc<dyn ReplySink> = Arc::new(sink);
    let (control_tx, mut control) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                Some(frame) = outbound.recv() => match encode_line(&frame) {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        tracing::error!("Failed to encode reply: {}", e);
                        continue;
                    }
                },
                Some(message) = control.recv() => message,
                else => break,
            };
            if let Err(e) = ws_tx.send(message).await {
                tracing::debug!("WebSocket write failed: {}", e);
                break;
            }
        }
    });

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = ws_rx.next() => message,
        };
        let payload = match message {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!("WebSocket read from {} failed: {}", addr, e);
                break;
            }
        };

        if payload == HEARTBEAT_PING.as_bytes() {
            let _ = control_tx.send(Message::Text(HEARTBEAT_PONG.to_string()));
            continue;
        }
        if payload == HEARTBEAT_PONG.as_bytes() {
            continue;
        }
        match Frame::decode_slice(&payload) {
            Some(frame) => kernel.accept_frame(frame, &peer, sink.clone()),
            None => tracing::debug!("Dropping malformed ws frame from {}", addr),
        }
    }

    tracing::debug!("WebSocket connection {} closed", sink_id);
    kernel.sign_out(&sink_id);
}
