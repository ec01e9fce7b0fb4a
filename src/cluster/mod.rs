//! Member center: kernel-side registry of worker nodes.
//!
//! Nodes register their service lists through the handshake; a request that
//! no local handler serves is balanced across the members advertising a
//! matching service. The call travels as
//! `{event: "/invokeAction", tid, data: {actionPath, request}}` over the
//! node's own channel and comes back as a `tid`-tagged reply, correlated
//! through a [`CorrelationTable`] that is independent of client `rid`s.

use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

mod member;

pub use member::{decay, score, MemberSnapshot, ServiceSnapshot, DECAY_RATE};

use member::{Member, Service};

use crate::correlation::CorrelationTable;
use crate::envelope::reply::NODE_FAILURE;
use crate::envelope::{Reply, Request};
use crate::registry::matching::rank_url;
use crate::registry::Advertised;
use crate::transport::ReplySink;
use crate::types::{Error, NodeId, SinkId};

/// Reserved event carrying a cluster call to a worker.
pub const INVOKE_ACTION: &str = "/invokeAction";

/// Cluster membership and load-balanced invocation.
pub struct MemberCenter {
    members: Mutex<Vec<Member>>,
    pending: CorrelationTable<Reply>,
}

impl std::fmt::Debug for MemberCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberCenter")
            .field("members", &self.members.lock().len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

struct Target {
    sink: Arc<dyn ReplySink>,
    handler_name: String,
}

impl MemberCenter {
    pub fn new(task_timeout: Duration) -> Self {
        Self {
            members: Mutex::new(Vec::new()),
            pending: CorrelationTable::new("cluster", task_timeout),
        }
    }

    /// Add (or overwrite) the member bound to `sink`. Duplicate action ids
    /// within the list are dropped.
    pub fn shakehand(&self, node_id: NodeId, services: Vec<Advertised>, sink: Arc<dyn ReplySink>) {
        let mut unique: Vec<Service> = Vec::with_capacity(services.len());
        for advertised in services {
            if unique
                .iter()
                .any(|s| s.advertised.handler_name == advertised.handler_name)
            {
                tracing::warn!(
                    "Node {} advertised {} twice, keeping the first",
                    node_id,
                    advertised.handler_name
                );
                continue;
            }
            unique.push(Service::new(advertised));
        }

        tracing::info!(
            "Node {} signed in over {} ({} services, sink {})",
            node_id,
            sink.protocol(),
            unique.len(),
            sink.id()
        );
        let member = Member {
            sink,
            node_id,
            services: unique,
        };

        let mut members = self.members.lock();
        match members.iter_mut().find(|m| m.sink_id() == member.sink_id()) {
            Some(existing) => *existing = member,
            None => members.push(member),
        }
    }

    /// Remove the member bound to `sink_id` and fail its in-flight calls.
    pub fn sign_out(&self, sink_id: &SinkId) -> bool {
        let removed = {
            let mut members = self.members.lock();
            let before = members.len();
            members.retain(|m| m.sink_id() != sink_id);
            before != members.len()
        };
        if removed {
            tracing::info!("Node on sink {} signed out", sink_id);
            self.pending.reject_owner(sink_id.as_str(), "member node signed out");
        }
        removed
    }

    /// Whether any member advertises a service matching `request`.
    pub fn has_match(&self, request: &Request) -> bool {
        self.members
            .lock()
            .iter()
            .flat_map(|m| m.services.iter())
            .any(|s| s.advertised.route.matches_request(request))
    }

    /// Balance `request` onto the best member.
    pub async fn invoke(&self, request: Request) -> Reply {
        let Some(target) = self.select(&request) else {
            return Reply::not_found();
        };
        let owner = target.sink.id().clone();

        let pending = self.pending.issue(owner.as_str());
        let frame = json!({
            "event": INVOKE_ACTION,
            "tid": pending.id(),
            "data": {
                "actionPath": target.handler_name,
                "request": request,
            },
        });

        let started = Instant::now();
        let outcome = match target.sink.send(frame) {
            Ok(()) => pending.wait().await,
            Err(e) => Err(e),
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.finish(&owner, &target.handler_name, elapsed_ms);

        match outcome {
            Ok(reply) => reply,
            Err(e @ Error::Remote { .. }) => Reply::from_error(&e),
            Err(e) => {
                tracing::error!("Call to {} on sink {} failed: {}", target.handler_name, owner, e);
                Reply::failure(500, NODE_FAILURE)
            }
        }
    }

    /// Deliver a worker's reply to the waiting call.
    pub fn resume(&self, tid: &str, reply: Reply) -> bool {
        match reply {
            Reply::Failure { code, error } => self.pending.reject(tid, Error::remote(code, error)),
            other => self.pending.resolve(tid, other),
        }
    }

    pub fn members(&self) -> Vec<MemberSnapshot> {
        self.members.lock().iter().map(Member::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    /// Pick the member and mark the chosen service as running.
    fn select(&self, request: &Request) -> Option<Target> {
        let mut members = self.members.lock();

        let mut matches: Vec<(usize, usize)> = Vec::new();
        for (mi, member) in members.iter().enumerate() {
            for (si, service) in member.services.iter().enumerate() {
                if service.advertised.route.matches_request(request) {
                    matches.push((mi, si));
                }
            }
        }

        // Collapse to the single most specific url.
        let best_url = matches
            .iter()
            .map(|&(mi, si)| members[mi].services[si].advertised.route.url.clone())
            .max_by_key(|url| rank_url(url))?;

        let mut chosen: Option<((usize, usize), f64)> = None;
        for &(mi, si) in &matches {
            let service = &members[mi].services[si];
            if service.advertised.route.url != best_url {
                continue;
            }
            let score = service.score();
            if chosen.map_or(true, |(_, best)| score < best) {
                chosen = Some(((mi, si), score));
            }
        }
        let ((mi, si), _) = chosen?;

        let member = &mut members[mi];
        let service = &mut member.services[si];
        service.running += 1;
        tracing::debug!(
            "Routing {} to {} on node {}",
            request.event,
            service.advertised.handler_name,
            member.node_id
        );
        Some(Target {
            sink: member.sink.clone(),
            handler_name: service.advertised.handler_name.clone(),
        })
    }

    fn finish(&self, sink_id: &SinkId, handler_name: &str, elapsed_ms: f64) {
        let mut members = self.members.lock();
        let service = members
            .iter_mut()
            .find(|m| m.sink_id() == sink_id)
            .and_then(|m| {
                m.services
                    .iter_mut()
                    .find(|s| s.advertised.handler_name == handler_name)
            });
        if let Some(service) = service {
            service.finish(elapsed_ms);
        }
    }
}
