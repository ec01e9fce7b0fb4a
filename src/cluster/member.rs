//! Member nodes and per-service load statistics.

use serde::Serialize;
use std::sync::Arc;

use crate::envelope::Protocol;
use crate::registry::Advertised;
use crate::transport::ReplySink;
use crate::types::{NodeId, SinkId};

/// Weight of the newest sample in the latency average.
pub const DECAY_RATE: f64 = 0.2;

/// Selection score; lower is better. A service that has never been called
/// scores zero.
pub fn score(avg_latency_ms: f64, running: usize, completed: u64) -> f64 {
    avg_latency_ms * (running as f64 + completed as f64 / 100.0 + 2.0)
}

/// Fold a new latency sample into the decayed average.
pub fn decay(avg_latency_ms: f64, sample_ms: f64) -> f64 {
    sample_ms * DECAY_RATE + avg_latency_ms * (1.0 - DECAY_RATE)
}

/// One advertised service plus its load counters.
#[derive(Debug, Clone)]
pub(crate) struct Service {
    pub advertised: Advertised,
    pub running: usize,
    pub completed: u64,
    pub avg_latency_ms: f64,
}

impl Service {
    pub fn new(advertised: Advertised) -> Self {
        Self {
            advertised,
            running: 0,
            completed: 0,
            avg_latency_ms: 0.0,
        }
    }

    pub fn score(&self) -> f64 {
        score(self.avg_latency_ms, self.running, self.completed)
    }

    pub fn finish(&mut self, elapsed_ms: f64) {
        self.running = self.running.saturating_sub(1);
        self.completed += 1;
        self.avg_latency_ms = decay(self.avg_latency_ms, elapsed_ms);
    }
}

/// A registered worker node.
#[derive(Debug)]
pub(crate) struct Member {
    pub sink: Arc<dyn ReplySink>,
    pub node_id: NodeId,
    pub services: Vec<Service>,
}

impl Member {
    pub fn sink_id(&self) -> &SinkId {
        self.sink.id()
    }

    pub fn snapshot(&self) -> MemberSnapshot {
        MemberSnapshot {
            node_id: self.node_id.clone(),
            sink_id: self.sink.id().clone(),
            protocol: self.sink.protocol(),
            services: self
                .services
                .iter()
                .map(|s| ServiceSnapshot {
                    handler_name: s.advertised.handler_name.clone(),
                    url: s.advertised.route.url.clone(),
                    running: s.running,
                    completed: s.completed,
                    avg_latency_ms: s.avg_latency_ms,
                })
                .collect(),
        }
    }
}

/// Read-only view of a member.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberSnapshot {
    pub node_id: NodeId,
    pub sink_id: SinkId,
    pub protocol: Protocol,
    pub services: Vec<ServiceSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSnapshot {
    pub handler_name: String,
    pub url: String,
    pub running: usize,
    pub completed: u64,
    pub avg_latency_ms: f64,
}
