//! Line-stream servers: TCP and Unix domain socket.
//!
//! Both speak newline-delimited JSON. Each connection gets a reader loop
//! that feeds decoded frames to the kernel and a writer task that drains the
//! connection's [`ChannelSink`]. When the peer goes away the kernel is told
//! to sign the connection out.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::codec::{encode_line, line_codec};
use super::{ChannelSink, Peer, ReplySink};
use crate::envelope::{Frame, Protocol};
use crate::kernel::Kernel;
use crate::types::{Result, TransportConfig};

/// TCP line server.
#[derive(Debug)]
pub struct TcpServer {
    listener: TcpListener,
    kernel: Arc<Kernel>,
    config: TransportConfig,
    cancel: CancellationToken,
}

impl TcpServer {
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

    /// Run the accept loop until cancelled.
    pub async fn serve(self) -> Result<()> {
        let limit = Arc::new(Semaphore::new(self.config.max_connections));
        tracing::info!(
            "TCP server listening on {} (max_connections={})",
            self.local_addr()?,
            self.config.max_connections,
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("TCP server shutting down");
                    break;
                }
                accept = self.listener.accept() => {
                    let (stream, addr) = match accept {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("TCP accept failed: {}", e);
                            continue;
                        }
                    };
                    let Some(permit) = admit(&limit, &self.config, &addr.to_string()) else {
                        continue;
                    };
                    let _ = stream.set_nodelay(true);
                    tracing::debug!("TCP connection from {}", addr);
                    tokio::spawn(handle_connection(
                        stream,
                        Peer::from_socket(Protocol::Tcp, addr),
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

/// Unix domain socket line server for processes on the same host.
#[derive(Debug)]
pub struct UnixServer {
    listener: UnixListener,
    path: PathBuf,
    kernel: Arc<Kernel>,
    config: TransportConfig,
    cancel: CancellationToken,
}

impl UnixServer {
    /// Bind `path`, replacing a stale socket file left by a previous run.
    pub fn bind(
        path: &Path,
        kernel: Arc<Kernel>,
        config: TransportConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            kernel,
            config,
            cancel,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn serve(self) -> Result<()> {
        let limit = Arc::new(Semaphore::new(self.config.max_connections));
        tracing::info!(
            "IPC server listening on {} (max_connections={})",
            self.path.display(),
            self.config.max_connections,
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("IPC server shutting down");
                    break;
                }
                accept = self.listener.accept() => {
                    let (stream, _) = match accept {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("IPC accept failed: {}", e);
                            continue;
                        }
                    };
                    let Some(permit) = admit(&limit, &self.config, "unix peer") else {
                        continue;
                    };
                    // Same-host peers have no address; they count as localhost.
                    let peer = Peer {
                        protocol: Protocol::Ipc,
                        remote_addr: None,
                        host: Some("localhost".to_string()),
                    };
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        self.kernel.clone(),
                        self.config.clone(),
                        self.cancel.clone(),
                        permit,
                    ));
                }
            }
        }

        let _ = std::fs::remove_file(&self.path);
        Ok(())
    }
}

/// Take a connection slot, or refuse the connection when at capacity.
fn admit(limit: &Arc<Semaphore>, config: &TransportConfig, who: &str) -> Option<OwnedSemaphorePermit> {
    match limit.clone().try_acquire_owned() {
        Ok(permit) => Some(permit),
        Err(_) => {
            tracing::warn!(
                "Connection from {} rejected: at max_connections ({})",
                who,
                config.max_connections,
            );
            None
        }
    }
}

/// Serve one line-stream connection until EOF, error, idle timeout or
/// shutdown.
async fn handle_connection<S>(
    stream: S,
    peer: Peer,
    kernel: Arc<Kernel>,
    config: TransportConfig,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit, // held for connection lifetime
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut lines = FramedRead::new(reader, line_codec(config.max_frame_bytes));
    let mut out = FramedWrite::new(writer, line_codec(config.max_frame_bytes));

    let (sink, mut outbound) = ChannelSink::new(peer.protocol);
    let sink_id = sink.id().clone();
    let sink: Arc<dyn ReplySink> = Arc::new(sink);

    // Ends once every clone of the sink is gone and the queue is drained.
    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let line = match encode_line(&frame) {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!("Failed to encode reply: {}", e);
                    continue;
                }
            };
            if let Err(e) = out.send(line).await {
                tracing::debug!("Write failed, closing writer: {}", e);
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = next_line(&mut lines, config.idle_timeout) => match next {
                Some(Ok(line)) => match Frame::decode_slice(line.as_bytes()) {
                    Some(frame) => kernel.accept_frame(frame, &peer, sink.clone()),
                    None => tracing::debug!("Dropping malformed {} frame", peer.protocol),
                },
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    tracing::warn!(
                        "{} frame over {} bytes, dropping connection",
                        peer.protocol,
                        config.max_frame_bytes,
                    );
                    break;
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    tracing::debug!("{} read error: {}", peer.protocol, e);
                    break;
                }
                None => break,
            },
        }
    }

    tracing::debug!("{} connection {} closed", peer.protocol, sink_id);
    kernel.sign_out(&sink_id);
}

/// Next line, or `None` on EOF or after `idle` without traffic.
async fn next_line<R>(
    lines: &mut FramedRead<R, LinesCodec>,
    idle: Option<Duration>,
) -> Option<std::result::Result<String, LinesCodecError>>
where
    R: AsyncRead + Unpin,
{
    match idle {
        Some(idle) => match tokio::time::timeout(idle, lines.next()).await {
            Ok(next) => next,
            Err(_) => {
                tracing::debug!("Idle for {:?}, dropping connection", idle);
                None
            }
        },
        None => lines.next().await,
    }
}
