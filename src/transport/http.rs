//! HTTP adapter. Any method on any path; the path is the event.

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use base64::Engine;
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::host_name;
use crate::envelope::{Envelope, Protocol, Reply, Request};
use crate::kernel::Kernel;
use crate::types::{Error, Result};

#[derive(Debug)]
pub struct HttpServer {
    listener: TcpListener,
    kernel: Arc<Kernel>,
    cancel: CancellationToken,
}

impl HttpServer {
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
        tracing::info!("HTTP server listening on {}", self.local_addr()?);
        let cancel = self.cancel.clone();
        axum::serve(
            self.listener,
            router(self.kernel).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::internal(format!("HTTP server failed: {}", e)))?;
        tracing::info!("HTTP server shutting down");
        Ok(())
    }
}

pub fn router(kernel: Arc<Kernel>) -> Router {
    Router::new().fallback(dispatch).with_state(kernel)
}

async fn dispatch(
    State(kernel): State<Arc<Kernel>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| host_name(h).to_string())
        .unwrap_or_else(|| addr.ip().to_string());

    let mut request = Request::new(Protocol::Http, uri.path())
        .with_method(method.as_str())
        .with_body(decode_body(&body))
        .with_remote_addr(addr.to_string())
        .with_host(host);
    request.query = query;

    tracing::debug!("HTTP {} {} from {}", request.method, request.event, addr);
    let reply = kernel.route(Envelope::detached(request)).await;
    reply_response(&reply)
}

/// JSON if it parses, otherwise text, otherwise base64.
fn decode_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    if let Ok(value) = serde_json::from_slice(body) {
        return value;
    }
    match std::str::from_utf8(body) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::String(base64::engine::general_purpose::STANDARD.encode(body)),
    }
}

fn reply_response(reply: &Reply) -> Response {
    let status = match reply.code() {
        None => StatusCode::OK,
        Some(code) => StatusCode::from_u16(code)
            .ok()
            .filter(|s| s.is_client_error() || s.is_server_error())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    };
    (status, Json(reply.to_value())).into_response()
}
