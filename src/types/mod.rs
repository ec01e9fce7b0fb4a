//! Core types for the dispatch fabric.
//!
//! - **IDs**: Strongly-typed identifiers (ActionId, NodeId, TaskId, SinkId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for kernel, transports and workers

mod config;
mod errors;
mod ids;

pub use config::{
    Config, KernelConfig, MasterConfig, NodeConfig, ObservabilityConfig, RestartConfig,
    TransportConfig, WorkerConfig,
};
pub use errors::{Error, Result};
pub use ids::{local_ip, ActionId, NodeId, SinkId, TaskId};
