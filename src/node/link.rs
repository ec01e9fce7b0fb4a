//! Worker-side connections to a kernel.
//!
//! Every link is reduced to the same shape: something that takes outbound
//! frames and a queue of inbound frames. Socket links run a reader task and
//! a writer task that stop when the node's token is cancelled. A reader that
//! loses the kernel cancels the token itself, so the whole link goes down.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::transport::codec::{encode_line, line_codec, HEARTBEAT_PING, HEARTBEAT_PONG};
use crate::transport::websocket::ws_config;
use crate::transport::LocalSender;
use crate::types::{Error, Result};

/// Sending half of a kernel link.
#[derive(Debug, Clone)]
pub(crate) enum Outbound {
    Local(LocalSender),
    Queue(mpsc::UnboundedSender<Value>),
}

impl Outbound {
    pub fn send(&self, frame: Value) -> Result<()> {
        match self {
            Outbound::Local(sender) => {
                sender.send(frame);
                Ok(())
            }
            Outbound::Queue(tx) => tx
                .send(frame)
                .map_err(|_| Error::channel_closed("kernel link closed")),
        }
    }

    /// Drop the link from the kernel's point of view.
    pub fn close(&self) {
        if let Outbound::Local(sender) = self {
            sender.close();
        }
    }
}

#[derive(Debug)]
pub(crate) struct Link {
    pub outbound: Outbound,
    pub inbound: mpsc::UnboundedReceiver<Value>,
}

fn parse_frame(raw: &str) -> Option<Value> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!("Dropping malformed frame from kernel: {}", e);
            None
        }
    }
}

/// Newline-delimited JSON over a Unix domain socket.
pub(crate) async fn open_unix(path: &Path, max_frame_bytes: usize, cancel: CancellationToken) -> Result<Link> {
    let stream = UnixStream::connect(path).await?;
    tracing::info!("Connected to IPC server at {}", path.display());

    let (reader, writer) = stream.into_split();
    let mut lines = FramedRead::new(reader, line_codec(max_frame_bytes));
    let mut out = FramedWrite::new(writer, line_codec(max_frame_bytes));
    let (in_tx, inbound) = mpsc::unbounded_channel();
    let (out_tx, mut outbound) = mpsc::unbounded_channel::<Value>();

    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = writer_cancel.cancelled() => break,
                frame = outbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let line = match encode_line(&frame) {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!("Failed to encode frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = out.send(line).await {
                tracing::warn!("IPC write failed: {}", e);
                break;
            }
        }
    });

    tokio::spawn(async move {
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next() => line,
            };
            match line {
                Some(Ok(line)) => {
                    if let Some(frame) = parse_frame(&line) {
                        if in_tx.send(frame).is_err() {
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("IPC read failed: {}", e);
                    break;
                }
                None => break,
            }
        }
        cancel.cancel();
        tracing::info!("Connection with kernel closed");
    });

    Ok(Link {
        outbound: Outbound::Queue(out_tx),
        inbound,
    })
}

/// WebSocket link with a periodic `heartbeat_ping`.
pub(crate) async fn open_ws(
    url: &str,
    heartbeat: Duration,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) -> Result<Link> {
    let (ws, _) = tokio_tungstenite::connect_async_with_config(url, Some(ws_config(max_frame_bytes)), false)
        .await
        .map_err(|e| Error::channel_closed(format!("cannot reach kernel at {}: {}", url, e)))?;
    tracing::info!("Connected to WS server at {}", url);

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (in_tx, inbound) = mpsc::unbounded_channel();
    let (out_tx, mut outbound) = mpsc::unbounded_channel::<Value>();

    let heartbeat = heartbeat.max(Duration::from_millis(10));
    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
        loop {
            let message = tokio::select! {
                _ = writer_cancel.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                _ = ticker.tick() => Message::Text(HEARTBEAT_PING.to_string()),
                frame = outbound.recv() => match frame {
                    Some(frame) => match encode_line(&frame) {
                        Ok(text) => Message::Text(text),
                        Err(e) => {
                            tracing::error!("Failed to encode frame: {}", e);
                            continue;
                        }
                    },
                    None => break,
                },
            };
            if let Err(e) = ws_tx.send(message).await {
                tracing::warn!("WS write failed: {}", e);
                break;
            }
        }
    });

    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = ws_rx.next() => message,
            };
            let text = match message {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::warn!("WS read failed: {}", e);
                    break;
                }
            };
            if text == HEARTBEAT_PONG {
                continue;
            }
            if let Some(frame) = parse_frame(&text) {
                if in_tx.send(frame).is_err() {
                    break;
                }
            }
        }
        cancel.cancel();
        tracing::info!("Connection with kernel closed");
    });

    Ok(Link {
        outbound: Outbound::Queue(out_tx),
        inbound,
    })
}
