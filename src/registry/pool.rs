//! Pool supervisor: one long-lived execution unit per pooled handler.
//!
//! A unit is a dedicated OS thread with its own current-thread runtime. The
//! supervisor talks to it over two channels:
//!
//! ```text
//! supervisor ── Task{tid, request} ──▶ unit
//! supervisor ◀── Mounted{ok} ───────── unit   (once, after on_mount)
//! supervisor ◀── Reply{tid, reply} ─── unit   (any order)
//! ```
//!
//! Calls are multiplexed through a [`CorrelationTable`] owned by the
//! supervisor. When a unit dies unexpectedly its pending tasks are rejected
//! at once and it is rebuilt with exponential backoff. Too many failures
//! inside the restart window trip a breaker: the handler stays `Unhealthy`
//! until it is registered again.
//!
//! A replacement unit (after a restart or a re-registration) is installed
//! only once it reports `Mounted{ok: true}`; the unit it replaces is retired
//! afterwards and drains its in-flight tasks before exiting.

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use super::handler::{run_to_reply, ActionHandler};
use super::recovery::catch_panic;
use crate::correlation::CorrelationTable;
use crate::envelope::reply::{MISSING_HANDLER, SERVICE_TIMEOUT};
use crate::envelope::{Reply, Request};
use crate::types::{ActionId, Error, Result, RestartConfig};

// =============================================================================
// Unit protocol
// =============================================================================

#[derive(Debug)]
enum UnitInbound {
    Task { tid: String, request: Request },
    /// Stop taking tasks, finish in-flight ones, exit.
    Retire,
    /// Exit immediately, abandoning in-flight tasks.
    Kill,
}

#[derive(Debug)]
enum UnitOutbound {
    Mounted { ok: bool },
    Reply { tid: String, reply: Reply },
}

/// Health of a pooled handler's unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitHealth {
    /// First unit not mounted yet.
    Starting,
    Healthy,
    /// Unit died and is being rebuilt.
    Degraded,
    /// Breaker tripped; no more restarts until re-registration.
    Unhealthy,
}

// =============================================================================
// Supervisor state
// =============================================================================

#[derive(Debug)]
struct Unit {
    generation: u64,
    owner: String,
    tx: mpsc::UnboundedSender<UnitInbound>,
}

struct Slot {
    handler: Arc<dyn ActionHandler>,
    /// Bumped on every registration; stale supervise loops exit when they
    /// notice they belong to an older epoch.
    epoch: u64,
    active: Option<Unit>,
    failures: VecDeque<Instant>,
    restarts: u64,
    health: watch::Sender<UnitHealth>,
}

struct Inner {
    restart: RestartConfig,
    pending: CorrelationTable<Reply>,
    slots: Mutex<HashMap<ActionId, Slot>>,
    generations: AtomicU64,
}

/// Supervisor of all pooled units of one registry.
#[derive(Clone)]
pub struct PoolSupervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PoolSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSupervisor")
            .field("units", &self.inner.slots.lock().len())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

enum Outcome {
    /// The unit this loop installed was replaced or the epoch moved on.
    Superseded,
    /// The unit failed to mount or died while active.
    Failed,
}

impl PoolSupervisor {
    pub fn new(restart: RestartConfig, task_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                restart,
                pending: CorrelationTable::new("pool", task_timeout),
                slots: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Stand up (or replace) the unit of `action`. Re-registration resets
    /// the breaker but keeps the restart count.
    ///
    /// Must be called from within a Tokio runtime; the supervise loop runs
    /// on it.
    pub fn register(&self, action: ActionId, handler: Arc<dyn ActionHandler>) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::internal(format!("pooled handler {} registered outside a runtime", action)))?;
        let epoch = {
            let mut slots = self.inner.slots.lock();
            let slot = slots.entry(action.clone()).or_insert_with(|| Slot {
                handler: handler.clone(),
                epoch: 0,
                active: None,
                failures: VecDeque::new(),
                restarts: 0,
                health: watch::channel(UnitHealth::Starting).0,
            });
            slot.handler = handler;
            slot.epoch += 1;
            slot.failures.clear();
            if slot.active.is_none() {
                slot.health.send_replace(UnitHealth::Starting);
            }
            slot.epoch
        };

        let supervisor = self.clone();
        runtime.spawn(async move { supervisor.supervise(action, epoch).await });
        Ok(())
    }

    /// Run one call on the unit of `action`.
    pub async fn dispatch(&self, action: &ActionId, request: Request) -> Reply {
        let unit = {
            let slots = self.inner.slots.lock();
            slots
                .get(action)
                .and_then(|slot| slot.active.as_ref())
                .map(|unit| (unit.owner.clone(), unit.tx.clone()))
        };
        let Some((owner, tx)) = unit else {
            return Reply::failure(500, MISSING_HANDLER);
        };

        let pending = self.inner.pending.issue(&owner);
        let tid = pending.id().as_str().to_string();
        if tx.send(UnitInbound::Task { tid, request }).is_err() {
            tracing::warn!("Pooled unit {} is gone", owner);
            return Reply::worker_down();
        }

        match pending.wait().await {
            Ok(reply) => reply,
            Err(Error::Timeout(msg)) => {
                tracing::warn!("{}", msg);
                Reply::failure(504, SERVICE_TIMEOUT)
            }
            Err(e) => {
                tracing::warn!("Pooled task on {} failed: {}", owner, e);
                Reply::worker_down()
            }
        }
    }

    /// Kill the active unit of `action` without draining it. The supervisor
    /// treats this like any other unit death.
    pub fn terminate(&self, action: &ActionId) -> bool {
        let slots = self.inner.slots.lock();
        match slots.get(action).and_then(|slot| slot.active.as_ref()) {
            Some(unit) => {
                tracing::info!("Terminating pooled unit {}", unit.owner);
                unit.tx.send(UnitInbound::Kill).is_ok()
            }
            None => false,
        }
    }

    /// Wait until `action` has a mounted unit.
    pub async fn wait_ready(&self, action: &ActionId, timeout: Duration) -> Result<()> {
        let mut health = {
            let slots = self.inner.slots.lock();
            let slot = slots
                .get(action)
                .ok_or_else(|| Error::not_found(format!("no pooled handler {}", action)))?;
            slot.health.subscribe()
        };

        let settled = tokio::time::timeout(
            timeout,
            health.wait_for(|h| matches!(h, UnitHealth::Healthy | UnitHealth::Unhealthy)),
        )
        .await
        .map_err(|_| Error::timeout(format!("pooled unit {} not ready within {:?}", action, timeout)))?
        .map(|h| *h)
        .map_err(|_| Error::channel_closed(format!("pooled handler {} removed", action)))?;

        match settled {
            UnitHealth::Healthy => Ok(()),
            _ => Err(Error::internal(format!("pooled unit {} is unhealthy", action))),
        }
    }

    pub fn health(&self, action: &ActionId) -> Option<UnitHealth> {
        self.inner.slots.lock().get(action).map(|slot| *slot.health.borrow())
    }

    pub fn restarts(&self, action: &ActionId) -> u64 {
        self.inner.slots.lock().get(action).map_or(0, |slot| slot.restarts)
    }

    /// Number of tasks awaiting a unit reply.
    pub fn pending(&self) -> usize {
        self.inner.pending.len()
    }

    // =========================================================================
    // Supervision
    // =========================================================================

    async fn supervise(self, action: ActionId, epoch: u64) {
        let mut attempt: u32 = 0;
        loop {
            match self.run_unit(&action, epoch).await {
                Outcome::Superseded => return,
                Outcome::Failed => {}
            }

            let Some(delay) = self.record_failure(&action, epoch, attempt) else {
                return;
            };
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay).await;
            if !self.is_current(&action, epoch) {
                return;
            }
        }
    }

    /// Start one unit, install it once mounted and pump its replies until it
    /// exits.
    async fn run_unit(&self, action: &ActionId, epoch: u64) -> Outcome {
        let Some(handler) = self.handler_for(action, epoch) else {
            return Outcome::Superseded;
        };
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let owner = format!("{}#{}", action, generation);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        let thread_owner = owner.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("pool:{}", owner))
            .spawn(move || unit_main(thread_owner, handler, in_rx, out_tx));
        if let Err(e) = spawned {
            tracing::error!("Pooled unit {} failed to spawn: {}", owner, e);
            return Outcome::Failed;
        }

        match out_rx.recv().await {
            Some(UnitOutbound::Mounted { ok: true }) => {}
            Some(UnitOutbound::Mounted { ok: false }) => {
                tracing::warn!("Pooled unit {} failed to mount", owner);
                return Outcome::Failed;
            }
            Some(UnitOutbound::Reply { tid, .. }) => {
                tracing::warn!("Pooled unit {} replied to {} before mounting", owner, tid);
                return Outcome::Failed;
            }
            None => {
                tracing::warn!("Pooled unit {} exited before mounting", owner);
                return Outcome::Failed;
            }
        }

        let unit = Unit {
            generation,
            owner: owner.clone(),
            tx: in_tx,
        };
        if !self.install(action, epoch, unit) {
            return Outcome::Superseded;
        }
        tracing::info!("Pooled unit {} mounted", owner);

        while let Some(msg) = out_rx.recv().await {
            match msg {
                UnitOutbound::Reply { tid, reply } => {
                    self.inner.pending.resolve(&tid, reply);
                }
                UnitOutbound::Mounted { .. } => {
                    tracing::debug!("Ignoring repeated mount report from {}", owner);
                }
            }
        }

        // Outbound closed: the unit is gone. Whatever it still owed is lost.
        self.inner.pending.reject_owner(&owner, "pooled unit exited");
        if self.uninstall(action, epoch, generation) {
            tracing::error!("Pooled unit {} closed unexpectedly", owner);
            Outcome::Failed
        } else {
            tracing::debug!("Pooled unit {} retired", owner);
            Outcome::Superseded
        }
    }

    fn handler_for(&self, action: &ActionId, epoch: u64) -> Option<Arc<dyn ActionHandler>> {
        let slots = self.inner.slots.lock();
        slots
            .get(action)
            .filter(|slot| slot.epoch == epoch)
            .map(|slot| slot.handler.clone())
    }

    fn is_current(&self, action: &ActionId, epoch: u64) -> bool {
        self.inner
            .slots
            .lock()
            .get(action)
            .is_some_and(|slot| slot.epoch == epoch)
    }

    /// Make `unit` the active one and retire its predecessor.
    fn install(&self, action: &ActionId, epoch: u64, unit: Unit) -> bool {
        let previous = {
            let mut slots = self.inner.slots.lock();
            let Some(slot) = slots.get_mut(action).filter(|slot| slot.epoch == epoch) else {
                let _ = unit.tx.send(UnitInbound::Retire);
                return false;
            };
            let previous = slot.active.replace(unit);
            slot.health.send_replace(UnitHealth::Healthy);
            previous
        };
        if let Some(previous) = previous {
            tracing::info!("Retiring pooled unit {}", previous.owner);
            let _ = previous.tx.send(UnitInbound::Retire);
        }
        true
    }

    /// Drop `generation` from its slot if it is still the active unit of the
    /// current epoch. Returns whether it was (i.e. the exit was unexpected).
    fn uninstall(&self, action: &ActionId, epoch: u64, generation: u64) -> bool {
        let mut slots = self.inner.slots.lock();
        let Some(slot) = slots.get_mut(action) else {
            return false;
        };
        let is_active = slot
            .active
            .as_ref()
            .is_some_and(|unit| unit.generation == generation);
        if !is_active {
            return false;
        }
        slot.active = None;
        slot.epoch == epoch
    }

    /// Count a failure. Returns the backoff before the next attempt, or
    /// `None` when the loop should stop (breaker tripped or superseded).
    fn record_failure(&self, action: &ActionId, epoch: u64, attempt: u32) -> Option<Duration> {
        let restart = &self.inner.restart;
        let mut slots = self.inner.slots.lock();
        let slot = slots.get_mut(action).filter(|slot| slot.epoch == epoch)?;

        let now = Instant::now();
        slot.failures.push_back(now);
        while slot
            .failures
            .front()
            .is_some_and(|t| now.duration_since(*t) > restart.restart_window)
        {
            slot.failures.pop_front();
        }

        if slot.failures.len() > restart.max_restarts {
            tracing::error!(
                "Pooled handler {} tripped its breaker: {} failures within {:?}",
                action,
                slot.failures.len(),
                restart.restart_window,
            );
            slot.health.send_replace(UnitHealth::Unhealthy);
            return None;
        }

        slot.restarts += 1;
        slot.health.send_replace(UnitHealth::Degraded);
        let delay = backoff(restart, attempt);
        tracing::warn!("Restarting pooled handler {} in {:?} (restart #{})", action, delay, slot.restarts);
        Some(delay)
    }
}

/// `initial × 2^attempt`, capped.
fn backoff(restart: &RestartConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    restart
        .initial_backoff
        .saturating_mul(factor)
        .min(restart.max_backoff)
}

// =============================================================================
// Unit body
// =============================================================================

fn unit_main(
    owner: String,
    handler: Arc<dyn ActionHandler>,
    mut inbox: mpsc::UnboundedReceiver<UnitInbound>,
    outbox: mpsc::UnboundedSender<UnitOutbound>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Pooled unit {} failed to start runtime: {}", owner, e);
            return;
        }
    };

    runtime.block_on(async move {
        let ok = match catch_panic(handler.on_mount()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!("Pooled unit {} on_mount failed: {}", owner, e);
                false
            }
            Err(panic_msg) => {
                tracing::error!("Pooled unit {} panicked while mounting: {}", owner, panic_msg);
                false
            }
        };
        if outbox.send(UnitOutbound::Mounted { ok }).is_err() || !ok {
            return;
        }

        let mut inflight = JoinSet::new();
        while let Some(msg) = inbox.recv().await {
            match msg {
                UnitInbound::Task { tid, request } => {
                    let handler = handler.clone();
                    let outbox = outbox.clone();
                    inflight.spawn(async move {
                        let reply = run_to_reply(handler.as_ref(), request, Reply::service_down).await;
                        let _ = outbox.send(UnitOutbound::Reply { tid, reply });
                    });
                }
                UnitInbound::Retire => break,
                UnitInbound::Kill => return,
            }
            while let Some(Some(_)) = inflight.join_next().now_or_never() {}
        }
        while inflight.join_next().await.is_some() {}
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Protocol;
    use crate::registry::handler::{handler_fn, HandlerError};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    fn fast_restart() -> RestartConfig {
        RestartConfig {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            max_restarts: 3,
            restart_window: Duration::from_secs(60),
        }
    }

    fn supervisor() -> PoolSupervisor {
        PoolSupervisor::new(fast_restart(), Duration::from_secs(5))
    }

    fn req(body: Value) -> Request {
        Request::new(Protocol::Local, "/pool").with_body(body)
    }

    fn echo() -> Arc<dyn ActionHandler> {
        handler_fn(|req: Request| async move { Ok(req.body) })
    }

    fn sleepy() -> Arc<dyn ActionHandler> {
        handler_fn(|req: Request| async move {
            let ms = req.body.as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(ms))
        })
    }

    struct NeverMounts(Arc<AtomicUsize>);

    #[async_trait]
    impl ActionHandler for NeverMounts {
        async fn handle(&self, _request: Request) -> std::result::Result<Value, HandlerError> {
            Ok(Value::Null)
        }

        async fn on_mount(&self) -> std::result::Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::fault("cannot mount"))
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let restart = RestartConfig::default();
        assert_eq!(backoff(&restart, 0), Duration::from_millis(50));
        assert_eq!(backoff(&restart, 1), Duration::from_millis(100));
        assert_eq!(backoff(&restart, 3), Duration::from_millis(400));
        assert_eq!(backoff(&restart, 30), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_unit() {
        let pool = supervisor();
        let reply = pool.dispatch(&ActionId::compose("m", "nope"), req(json!(1))).await;
        assert_eq!(reply, Reply::failure(500, MISSING_HANDLER));
    }

    #[tokio::test]
    async fn test_dispatch_after_ready() {
        let pool = supervisor();
        let action = ActionId::compose("m", "echo");
        pool.register(action.clone(), echo()).unwrap();
        pool.wait_ready(&action, Duration::from_secs(2)).await.unwrap();

        assert_eq!(pool.dispatch(&action, req(json!("hi"))).await, Reply::success("hi"));
        assert_eq!(pool.health(&action), Some(UnitHealth::Healthy));
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_replies_find_their_callers() {
        let pool = supervisor();
        let action = ActionId::compose("m", "sleepy");
        pool.register(action.clone(), sleepy()).unwrap();
        pool.wait_ready(&action, Duration::from_secs(2)).await.unwrap();

        let (slow, fast) = tokio::join!(
            pool.dispatch(&action, req(json!(150))),
            pool.dispatch(&action, req(json!(10))),
        );
        assert_eq!(slow, Reply::success(150));
        assert_eq!(fast, Reply::success(10));
    }

    #[tokio::test]
    async fn test_unit_death_rejects_pending_and_restarts() {
        let pool = supervisor();
        let action = ActionId::compose("m", "sleepy");
        pool.register(action.clone(), sleepy()).unwrap();
        pool.wait_ready(&action, Duration::from_secs(2)).await.unwrap();

        let in_flight = {
            let pool = pool.clone();
            let action = action.clone();
            tokio::spawn(async move { pool.dispatch(&action, req(json!(10_000))).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.terminate(&action));

        let reply = tokio::time::timeout(Duration::from_secs(2), in_flight)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, Reply::worker_down());
        assert_eq!(pool.pending(), 0);

        // The unit comes back on its own.
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.wait_ready(&action, Duration::from_secs(2)).await.unwrap();
        assert_eq!(pool.dispatch(&action, req(json!(1))).await, Reply::success(1));
        assert_eq!(pool.restarts(&action), 1);
    }

    #[tokio::test]
    async fn test_handler_fault_is_service_down_and_keeps_the_unit() {
        let pool = supervisor();
        let action = ActionId::compose("m", "faulty");
        pool.register(
            action.clone(),
            handler_fn(|req: Request| async move {
                if req.body.is_null() {
                    panic!("no body");
                }
                Err(HandlerError::fault("refused"))
            }),
        )
        .unwrap();
        pool.wait_ready(&action, Duration::from_secs(2)).await.unwrap();

        assert_eq!(pool.dispatch(&action, req(Value::Null)).await, Reply::service_down());
        assert_eq!(pool.dispatch(&action, req(json!(1))).await, Reply::service_down());
        assert_eq!(pool.health(&action), Some(UnitHealth::Healthy));
        assert_eq!(pool.restarts(&action), 0);
    }

    #[test]
    fn test_register_outside_runtime_is_an_error() {
        let pool = supervisor();
        let err = pool.register(ActionId::compose("m", "echo"), echo()).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(pool.health(&ActionId::compose("m", "echo")), None);
    }

    #[tokio::test]
    async fn test_task_timeout_replies_504() {
        let pool = PoolSupervisor::new(fast_restart(), Duration::from_millis(50));
        let action = ActionId::compose("m", "sleepy");
        pool.register(action.clone(), sleepy()).unwrap();
        pool.wait_ready(&action, Duration::from_secs(2)).await.unwrap();

        let reply = pool.dispatch(&action, req(json!(1_000))).await;
        assert_eq!(reply, Reply::failure(504, SERVICE_TIMEOUT));
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn test_breaker_trips_and_reregistration_resets_it() {
        let pool = supervisor();
        let action = ActionId::compose("m", "broken");
        let attempts = Arc::new(AtomicUsize::new(0));
        pool.register(action.clone(), Arc::new(NeverMounts(attempts.clone()))).unwrap();

        let err = pool.wait_ready(&action, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(pool.health(&action), Some(UnitHealth::Unhealthy));
        // max_restarts = 3: the fourth failure trips.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 4);

        pool.register(action.clone(), echo()).unwrap();
        pool.wait_ready(&action, Duration::from_secs(2)).await.unwrap();
        assert_eq!(pool.dispatch(&action, req(json!(2))).await, Reply::success(2));
        assert_eq!(pool.restarts(&action), 3);
    }

    #[tokio::test]
    async fn test_replacement_keeps_serving_until_mounted() {
        let pool = supervisor();
        let action = ActionId::compose("m", "swap");
        pool.register(action.clone(), handler_fn(|_| async { Ok(json!("old")) })).unwrap();
        pool.wait_ready(&action, Duration::from_secs(2)).await.unwrap();

        pool.register(action.clone(), handler_fn(|_| async { Ok(json!("new")) })).unwrap();
        // Either unit may answer during the swap, but never "Missing Handler".
        let reply = pool.dispatch(&action, req(Value::Null)).await;
        assert!(!reply.is_error());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.dispatch(&action, req(Value::Null)).await, Reply::success("new"));
    }
}
