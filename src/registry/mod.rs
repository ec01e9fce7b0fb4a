//! Handler registry and execution engine.
//!
//! Holds every locally loaded handler, matches requests against their
//! routes, enforces per-handler admission and executes the winner in its
//! configured mode. The registry is shared by the kernel (local handlers) and
//! by worker nodes (handlers they advertise to the cluster).

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod admission;
pub mod ephemeral;
pub mod handler;
pub mod matching;
pub mod pool;
pub mod recovery;

pub use admission::AdmissionGate;
pub use handler::{handler_fn, ActionHandler, ExecutionMode, FnHandler, HandlerError, HandlerModule, HandlerSpec};
pub use matching::Route;
pub use pool::{PoolSupervisor, UnitHealth};

use crate::envelope::reply::EMPTY_TARGET_PATH;
use crate::envelope::{Reply, Request, Resolution};
use crate::types::{ActionId, Error, KernelConfig, Result};

/// Service entry a worker sends at handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advertised {
    #[serde(flatten)]
    pub route: Route,
    /// Action id on the advertising node.
    pub handler_name: String,
}

/// Per-handler counters.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerStats {
    pub action: ActionId,
    pub url: String,
    pub mode: ExecutionMode,
    pub concurrent: usize,
    pub running: usize,
    pub queued: usize,
    pub completed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<UnitHealth>,
}

struct Registered {
    action: ActionId,
    route: Route,
    mode: ExecutionMode,
    gate: AdmissionGate,
    handler: Arc<dyn ActionHandler>,
}

/// Registry of local handlers.
pub struct HandlerRegistry {
    settle_delay: std::time::Duration,
    handlers: RwLock<Vec<Arc<Registered>>>,
    pool: PoolSupervisor,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.read().len())
            .field("pool", &self.pool)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            settle_delay: config.settle_delay,
            handlers: RwLock::new(Vec::new()),
            pool: PoolSupervisor::new(config.restart.clone(), config.task_timeout),
        }
    }

    /// Register one handler under `module_id`.
    ///
    /// Registering an action id that already exists replaces its route,
    /// mode and callback (and its pooled unit) but keeps its counters.
    pub fn register(&self, module_id: &str, spec: HandlerSpec) -> Result<ActionId> {
        if spec.name.is_empty() {
            return Err(Error::validation(format!("handler in {} has no name", module_id)));
        }
        if spec.url.is_empty() {
            return Err(Error::validation(format!("handler {} has no url", spec.name)));
        }

        let action = ActionId::compose(module_id, &spec.name);
        let route = Route::new(spec.url, spec.protocols, spec.methods, spec.only_full_path);
        if spec.mode == ExecutionMode::Pooled {
            self.pool.register(action.clone(), spec.handler.clone())?;
        }

        {
            let mut handlers = self.handlers.write();
            let existing = handlers.iter().position(|h| h.action == action);
            let gate = match existing {
                Some(i) if handlers[i].gate.limit() == spec.concurrent => handlers[i].gate.clone(),
                _ => AdmissionGate::new(spec.concurrent, self.settle_delay),
            };
            let entry = Arc::new(Registered {
                action: action.clone(),
                route,
                mode: spec.mode,
                gate,
                handler: spec.handler.clone(),
            });
            match existing {
                Some(i) => handlers[i] = entry,
                None => handlers.push(entry),
            }
        }

        tracing::info!("Handler {} registered ({:?})", action, spec.mode);
        Ok(action)
    }

    /// Register every handler of `module`. Invalid descriptors are skipped.
    pub fn mount(&self, module: &dyn HandlerModule) -> Vec<ActionId> {
        let module_id = module.module_id();
        module
            .handlers()
            .into_iter()
            .filter_map(|spec| match self.register(module_id, spec) {
                Ok(action) => Some(action),
                Err(e) => {
                    tracing::warn!("Skipping handler in module {}: {}", module_id, e);
                    None
                }
            })
            .collect()
    }

    pub fn has_match(&self, request: &Request) -> bool {
        self.handlers.read().iter().any(|h| h.route.matches_request(request))
    }

    /// Matching handlers, most specific first (registration order on ties).
    fn candidates(&self, request: &Request) -> Vec<Arc<Registered>> {
        let mut matched: Vec<Arc<Registered>> = self
            .handlers
            .read()
            .iter()
            .filter(|h| h.route.matches_request(request))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.route.rank().cmp(&a.route.rank()));
        matched
    }

    /// Route `request` to the matching handler(s).
    pub async fn invoke(&self, request: Request) -> Reply {
        if request.event.is_empty() {
            return Reply::failure(403, EMPTY_TARGET_PATH);
        }

        let mut candidates = self.candidates(&request);
        if candidates.is_empty() {
            return Reply::not_found();
        }

        match request.resolution {
            Resolution::Best => self.execute(&candidates[0], request).await,
            Resolution::Chain => {
                // Least specific first.
                candidates.sort_by_key(|h| h.route.rank());
                let mut last = Reply::not_found();
                for handler in &candidates {
                    last = self.execute(handler, request.clone()).await;
                    if !last.is_error() {
                        break;
                    }
                    tracing::debug!("Chain step {} failed, trying next", handler.action);
                }
                last
            }
        }
    }

    /// Run a specific handler by action id (cluster dispatch on workers).
    pub async fn invoke_action(&self, action: &str, request: Request) -> Reply {
        let handler = self
            .handlers
            .read()
            .iter()
            .find(|h| h.action.as_str() == action)
            .cloned();
        match handler {
            Some(handler) => self.execute(&handler, request).await,
            None => {
                tracing::warn!("No local action {}", action);
                Reply::not_found()
            }
        }
    }

    async fn execute(&self, handler: &Registered, request: Request) -> Reply {
        let _permit = handler.gate.acquire().await;
        match handler.mode {
            ExecutionMode::Inline => {
                handler::run_to_reply(handler.handler.as_ref(), request, Reply::service_down).await
            }
            ExecutionMode::Ephemeral => {
                ephemeral::run_ephemeral(&handler.action, handler.handler.clone(), request).await
            }
            ExecutionMode::Pooled => self.pool.dispatch(&handler.action, request).await,
        }
    }

    /// Service list for the handshake.
    pub fn list_advertised(&self) -> Vec<Advertised> {
        self.handlers
            .read()
            .iter()
            .map(|h| Advertised {
                route: h.route.clone(),
                handler_name: h.action.as_str().to_string(),
            })
            .collect()
    }

    pub fn stats(&self) -> Vec<HandlerStats> {
        self.handlers
            .read()
            .iter()
            .map(|h| HandlerStats {
                action: h.action.clone(),
                url: h.route.url.clone(),
                mode: h.mode,
                concurrent: h.gate.limit(),
                running: h.gate.running(),
                queued: h.gate.queued(),
                completed: h.gate.completed(),
                health: (h.mode == ExecutionMode::Pooled)
                    .then(|| self.pool.health(&h.action))
                    .flatten(),
            })
            .collect()
    }

    pub fn pool(&self) -> &PoolSupervisor {
        &self.pool
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}
