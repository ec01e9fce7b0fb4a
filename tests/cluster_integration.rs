//! Cluster integration tests: worker bootstrap over real links, handshake
//! trust and load-balanced calls.

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use synego_base::builtin::EchoModule;
use synego_base::envelope::{Protocol, Reply, Request};
use synego_base::kernel::{Kernel, SHAKEHAND};
use synego_base::node::{KernelChannel, WorkerNode};
use synego_base::registry::{handler_fn, ExecutionMode, HandlerModule, HandlerSpec};
use synego_base::transport::{TcpServer, UnixServer, WsServer};
use synego_base::types::{KernelConfig, MasterConfig, NodeId, TransportConfig, WorkerConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

struct Reverse;

impl HandlerModule for Reverse {
    fn module_id(&self) -> &str {
        "strings"
    }

    fn handlers(&self) -> Vec<HandlerSpec> {
        vec![HandlerSpec::new(
            "reverse",
            "/strings/reverse",
            handler_fn(|req: Request| async move {
                Ok(json!(req.body.as_str().unwrap_or_default().chars().rev().collect::<String>()))
            }),
        )
        .mode(ExecutionMode::Inline)]
    }
}

fn kernel(config: KernelConfig) -> Arc<Kernel> {
    Arc::new(Kernel::new(NodeId::from_string("kernel-it".to_string()).unwrap(), config))
}

fn worker(master: MasterConfig) -> WorkerNode {
    let worker = WorkerNode::new(
        NodeId::from_string("worker-it".to_string()).unwrap(),
        &KernelConfig::default(),
        WorkerConfig {
            master,
            heartbeat_interval: Duration::from_millis(50),
            shakehand_timeout: Duration::from_secs(5),
        },
    );
    worker.mount(&Reverse);
    worker
}

#[tokio::test]
async fn test_worker_joins_over_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kernel.sock");
    let kernel = kernel(KernelConfig::default());
    let cancel = CancellationToken::new();
    let server = UnixServer::bind(&path, kernel.clone(), TransportConfig::disabled(), cancel.clone()).unwrap();
    tokio::spawn(server.serve());

    let node = worker(MasterConfig {
        host: "127.0.0.1".to_string(),
        ws: None,
        ipc: Some(path.clone()),
    })
    .join(None)
    .await
    .unwrap();
    assert_eq!(node.channel(), &KernelChannel::Unix(path));
    assert_eq!(kernel.members().len(), 1);

    let reply = kernel
        .call(Request::new(Protocol::Http, "/strings/reverse").with_body("abc"))
        .await;
    assert_eq!(reply, Reply::success("cba"));

    node.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !kernel.members().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let reply = kernel
        .call(Request::new(Protocol::Http, "/strings/reverse").with_body("abc"))
        .await;
    assert_eq!(reply.code(), Some(404));
    cancel.cancel();
}

#[tokio::test]
async fn test_worker_frame_limit_applies_to_its_link() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kernel.sock");
    let kernel = kernel(KernelConfig::default());
    let cancel = CancellationToken::new();
    let server = UnixServer::bind(&path, kernel.clone(), TransportConfig::disabled(), cancel.clone()).unwrap();
    tokio::spawn(server.serve());

    let node = worker(MasterConfig {
        host: "127.0.0.1".to_string(),
        ws: None,
        ipc: Some(path),
    })
    .with_max_frame_bytes(4096)
    .join(None)
    .await
    .unwrap();

    let reply = kernel
        .call(Request::new(Protocol::Http, "/strings/reverse").with_body("ok"))
        .await;
    assert_eq!(reply, Reply::success("ko"));

    // A frame over the worker's limit takes its link down.
    let reply = tokio::time::timeout(
        Duration::from_secs(5),
        kernel.call(Request::new(Protocol::Http, "/strings/reverse").with_body("x".repeat(8192))),
    )
    .await
    .unwrap();
    assert_eq!(reply.code(), Some(500));
    tokio::time::timeout(Duration::from_secs(5), async {
        while !kernel.members().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    node.shutdown().await;
    cancel.cancel();
}

#[tokio::test]
async fn test_worker_joins_over_websocket() {
    let kernel = kernel(KernelConfig::default());
    kernel.mount(&EchoModule);
    let cancel = CancellationToken::new();
    let server = WsServer::bind("127.0.0.1:0", kernel.clone(), TransportConfig::disabled(), cancel.clone())
        .await
        .unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(server.serve());

    let node = worker(MasterConfig {
        host: "127.0.0.1".to_string(),
        ws: Some(port),
        ipc: None,
    })
    .join(None)
    .await
    .unwrap();
    assert!(matches!(node.channel(), KernelChannel::WebSocket(_)));

    // Heartbeats flow while the link idles; the registration survives them.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(kernel.members().len(), 1);

    let reply = kernel
        .call(Request::new(Protocol::Tcp, "/strings/reverse").with_body("ws"))
        .await;
    assert_eq!(reply, Reply::success("sw"));

    // Local handlers still win over the cluster.
    let reply = kernel.call(Request::new(Protocol::Tcp, "/echo").with_body(1)).await;
    assert_eq!(reply, Reply::success(1));

    node.shutdown().await;
    cancel.cancel();
}

#[tokio::test]
async fn test_untrusted_shakehand_is_rejected() {
    let kernel = kernel(KernelConfig {
        trusted_shakehand: vec!["10.255.255.1".to_string()],
        ..KernelConfig::default()
    });
    let cancel = CancellationToken::new();
    let server = TcpServer::bind("127.0.0.1:0", kernel.clone(), TransportConfig::disabled(), cancel.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let frame = json!({
        "event": SHAKEHAND,
        "rid": "s1",
        "data": {"nid": "intruder", "data": {"serviceList": []}},
    });
    stream
        .write_all(format!("{}\n", frame).as_bytes())
        .await
        .unwrap();

    let mut raw = String::new();
    tokio::time::timeout(Duration::from_secs(5), BufReader::new(stream).read_line(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let reply: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(
        reply,
        json!({"success": false, "reason": "Invalid Shakehand Channel", "rid": "s1"})
    );
    assert!(kernel.members().is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn test_join_without_any_channel_fails() {
    let err = worker(MasterConfig {
        host: "10.255.255.1".to_string(),
        ws: None,
        ipc: None,
    })
    .join(None)
    .await
    .unwrap_err();
    assert!(err.to_string().contains("Invalid Kernel Connection Configuration"));
}
