//! Transport integration tests: frame in, reply out, over every adapter.

use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use synego_base::builtin::EchoModule;
use synego_base::kernel::Kernel;
use synego_base::transport::rpc::{EnvelopeRequest, GatewayClient};
use synego_base::transport::{DatagramServer, HttpServer, RpcServer, TcpServer, WsServer};
use synego_base::types::{KernelConfig, NodeId, TransportConfig};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn kernel() -> Arc<Kernel> {
    let kernel = Kernel::new(
        NodeId::from_string("kernel-test".to_string()).unwrap(),
        KernelConfig::default(),
    );
    kernel.mount(&EchoModule);
    Arc::new(kernel)
}

#[tokio::test]
async fn test_tcp_round_trip_echoes_rid() {
    let cancel = CancellationToken::new();
    let server = TcpServer::bind("127.0.0.1:0", kernel(), TransportConfig::disabled(), cancel.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"{\"event\":\"/echo\",\"rid\":\"t1\",\"data\":{\"n\":1}}\n{\"event\":\"/missing\",\"rid\":\"t2\"}\n")
        .await
        .unwrap();

    let mut reader = BufReader::new(stream);
    let mut replies = Vec::new();
    for _ in 0..2 {
        let mut raw = String::new();
        tokio::time::timeout(WAIT, reader.read_line(&mut raw))
            .await
            .unwrap()
            .unwrap();
        assert!(raw.ends_with('\n'));
        replies.push(serde_json::from_str::<Value>(&raw).unwrap());
    }
    replies.sort_by_key(|r| r["rid"].as_str().unwrap_or_default().to_string());

    assert_eq!(replies[0], json!({"success": true, "data": {"n": 1}, "rid": "t1"}));
    assert_eq!(replies[1], json!({"code": 404, "error": "No such service", "rid": "t2"}));
    cancel.cancel();
}

#[tokio::test]
async fn test_udp_round_trip() {
    let cancel = CancellationToken::new();
    let server = DatagramServer::bind("127.0.0.1:0", kernel(), TransportConfig::disabled(), cancel.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"{\"event\":\"/echo\",\"rid\":\"u1\",\"data\":\"ping\"}", addr)
        .await
        .unwrap();
    let mut buf = [0u8; 1024];
    let (len, _) = tokio::time::timeout(WAIT, client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let reply: Value = serde_json::from_slice(&buf[..len]).unwrap();
    assert_eq!(reply, json!({"success": true, "data": "ping", "rid": "u1"}));
    cancel.cancel();
}

#[tokio::test]
async fn test_ws_heartbeat_and_round_trip() {
    let cancel = CancellationToken::new();
    let server = WsServer::bind("127.0.0.1:0", kernel(), TransportConfig::disabled(), cancel.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .unwrap();

    ws.send(Message::Text("heartbeat_ping".to_string())).await.unwrap();
    let pong = tokio::time::timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(pong, Message::Text("heartbeat_pong".to_string()));

    ws.send(Message::Text(json!({"event": "/echo", "rid": "w1", "data": [1, 2, 3]}).to_string()))
        .await
        .unwrap();
    let reply = tokio::time::timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    let reply: Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(reply, json!({"success": true, "data": [1, 2, 3], "rid": "w1"}));
    cancel.cancel();
}

#[tokio::test]
async fn test_grpc_round_trip() {
    let cancel = CancellationToken::new();
    let server = RpcServer::bind("127.0.0.1:0", kernel(), cancel.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());

    let mut client = GatewayClient::connect(format!("http://{}", addr)).await.unwrap();

    let reply = client
        .dispatch(EnvelopeRequest {
            data: json!({"event": "/echo", "rid": "g1", "data": {"hello": "grpc"}}).to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    let reply: Value = serde_json::from_str(&reply.reply).unwrap();
    assert_eq!(reply, json!({"success": true, "data": {"hello": "grpc"}, "rid": "g1"}));

    let reply = client
        .dispatch(EnvelopeRequest { data: json!({"data": 1}).to_string() })
        .await
        .unwrap()
        .into_inner();
    let reply: Value = serde_json::from_str(&reply.reply).unwrap();
    assert_eq!(reply, json!({"code": 403, "error": "empty target path"}));

    let reply = client
        .dispatch(EnvelopeRequest { data: "not json".to_string() })
        .await
        .unwrap()
        .into_inner();
    let reply: Value = serde_json::from_str(&reply.reply).unwrap();
    assert_eq!(reply["code"], json!(400));
    assert!(reply["error"]
        .as_str()
        .unwrap()
        .starts_with("validation error: invalid request"));
    cancel.cancel();
}

/// Minimal HTTP/1.1 exchange; returns status code and JSON body.
async fn http_request(addr: std::net::SocketAddr, method: &str, path: &str, body: &str) -> (u16, Value) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    tokio::time::timeout(WAIT, stream.read_to_string(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let status: u16 = raw.split_whitespace().nth(1).unwrap().parse().unwrap();
    let (_, body) = raw.split_once("\r\n\r\n").unwrap();
    (status, serde_json::from_str(body).unwrap())
}

#[tokio::test]
async fn test_http_round_trip() {
    let cancel = CancellationToken::new();
    let server = HttpServer::bind("127.0.0.1:0", kernel(), cancel.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());

    let (status, body) = http_request(addr, "POST", "/echo", r#"{"via":"http"}"#).await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"success": true, "data": {"via": "http"}}));

    let (status, body) = http_request(addr, "GET", "/nowhere?x=1", "").await;
    assert_eq!(status, 404);
    assert_eq!(body, json!({"code": 404, "error": "No such service"}));
    cancel.cancel();
}
