//! # Synego Base - Multi-Transport Dispatch Fabric
//!
//! Accepts requests over many wire transports, normalizes them into one
//! envelope and routes each to a locally registered handler or, failing
//! that, to a worker node in the cluster:
//! - Handler registry with inline, ephemeral and pooled execution
//! - Per-handler admission control
//! - Supervised pooled units with backoff, circuit breaker and health
//! - Load-balanced cluster routing with latency-decayed scoring
//! - Worker bootstrap and handshake over in-process, Unix or WebSocket links
//!
//! ## Architecture
//!
//! ```text
//!   TCP  UDP  Unix  WS  gRPC  HTTP  local
//!     \    \    |    |    /    /    /
//!      └────────┴────┴───┴────┴────┘
//!                    │  Frame + ReplySink
//!          ┌─────────▼──────────┐
//!          │       Kernel       │
//!          │  ┌──────────────┐  │      /invokeAction
//!          │  │   Registry   │  │   ┌──────────────────┐
//!          │  │ Inline/Eph/  │  │   │   Worker nodes   │
//!          │  │   Pooled     │  │   │  (own registry)  │
//!          │  └──────────────┘  │   └────────▲─────────┘
//!          │  ┌──────────────┐  │            │
//!          │  │ MemberCenter ├──┼────────────┘
//!          │  └──────────────┘  │
//!          └────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod builtin;
pub mod cluster;
pub mod correlation;
pub mod envelope;
pub mod kernel;
pub mod node;
pub mod registry;
pub mod transport;
pub mod types;

// Internal utilities
pub mod observability;

pub use envelope::{Envelope, Protocol, Reply, Request, Resolution};
pub use kernel::Kernel;
pub use node::{spawn_local_workers, NodeHandle, WorkerNode};
pub use registry::{ActionHandler, ExecutionMode, HandlerError, HandlerModule, HandlerSpec};
pub use types::{Config, Error, Result};
