//! Configuration structures.
//!
//! Configuration is loaded from a JSON file; every section falls back to its
//! defaults so a partial (or empty) file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{Error, Result};

/// Global configuration shared by kernel and worker processes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node identity.
    #[serde(default)]
    pub node: NodeConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Dispatch behavior (admission, timeouts, restarts, handshake trust).
    #[serde(default)]
    pub kernel: KernelConfig,

    /// Listening transports of a kernel.
    #[serde(default)]
    pub transports: TransportConfig,

    /// How a worker reaches its kernel.
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Config {
    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::validation(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Node identity.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    /// Explicit node id; defaults to `pid@ip`.
    pub id: Option<String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Dispatch behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Logical hosts allowed to send `/synego/shakehand`. The in-process
    /// channel is always trusted.
    pub trusted_shakehand: Vec<String>,

    /// Delay before a completed call releases the next queued caller.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,

    /// Timeout of every pending task (pooled unit or worker node call).
    #[serde(with = "humantime_serde")]
    pub task_timeout: Duration,

    /// Restart policy for pooled execution units.
    pub restart: RestartConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            trusted_shakehand: vec![
                "127.0.0.1".to_string(),
                "localhost".to_string(),
                "::1".to_string(),
            ],
            settle_delay: Duration::from_millis(50),
            task_timeout: Duration::from_secs(30),
            restart: RestartConfig::default(),
        }
    }
}

/// Restart policy for pooled execution units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Delay before the first restart.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Backoff ceiling; the delay doubles on each consecutive failure.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Failures tolerated inside `restart_window` before the breaker trips.
    pub max_restarts: usize,

    /// Sliding window for counting failures.
    #[serde(with = "humantime_serde")]
    pub restart_window: Duration,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            max_restarts: 5,
            restart_window: Duration::from_secs(60),
        }
    }
}

/// Listening transports. `None` disables a transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub http: Option<String>,
    pub tcp: Option<String>,
    pub udp: Option<String>,
    pub grpc: Option<String>,
    pub ws: Option<String>,

    /// Unix domain socket path for same-host processes.
    pub ipc: Option<PathBuf>,

    /// Maximum concurrent stream connections (TCP, Unix, WebSocket).
    pub max_connections: usize,

    /// Maximum frame (line, datagram, message) size in bytes.
    pub max_frame_bytes: usize,

    /// Drop stream connections idle for longer than this.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            http: Some("0.0.0.0:3000".to_string()),
            tcp: Some("0.0.0.0:3002".to_string()),
            udp: Some("0.0.0.0:3003".to_string()),
            grpc: Some("0.0.0.0:3004".to_string()),
            ws: Some("0.0.0.0:3005".to_string()),
            ipc: Some(PathBuf::from("/tmp/synego_communicate.sock")),
            max_connections: 1000,
            max_frame_bytes: 5 * 1024 * 1024,
            idle_timeout: None,
        }
    }
}

impl TransportConfig {
    /// No listeners at all; useful for embedding and tests.
    pub fn disabled() -> Self {
        Self {
            http: None,
            tcp: None,
            udp: None,
            grpc: None,
            ws: None,
            ipc: None,
            ..Self::default()
        }
    }
}

/// Worker-side view of the kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub master: MasterConfig,

    /// Keepalive interval on WebSocket links.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// How long to wait for the kernel to acknowledge the handshake.
    #[serde(with = "humantime_serde")]
    pub shakehand_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            master: MasterConfig::default(),
            heartbeat_interval: Duration::from_secs(30),
            shakehand_timeout: Duration::from_secs(10),
        }
    }
}

/// Address of the kernel a worker registers with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub host: String,
    pub ws: Option<u16>,
    pub ipc: Option<PathBuf>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ws: Some(3005),
            ipc: Some(PathBuf::from("/tmp/synego_communicate.sock")),
        }
    }
}
