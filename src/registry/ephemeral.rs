//! Ephemeral execution: one isolated unit per call.
//!
//! The unit is a fresh OS thread running its own current-thread runtime. It
//! produces exactly one reply and is torn down unconditionally afterwards,
//! taking any tasks the handler left behind with it.

use std::sync::Arc;
use tokio::sync::oneshot;

use super::handler::{run_to_reply, ActionHandler};
use crate::envelope::{Reply, Request};
use crate::types::ActionId;

/// Run one call on a dedicated unit.
pub async fn run_ephemeral(action: &ActionId, handler: Arc<dyn ActionHandler>, request: Request) -> Reply {
    let (tx, rx) = oneshot::channel();
    let thread_action = action.clone();

    let spawned = std::thread::Builder::new()
        .name(format!("ephemeral:{}", action))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!("Ephemeral unit {} failed to start runtime: {}", thread_action, e);
                    return;
                }
            };
            let reply = runtime.block_on(run_to_reply(handler.as_ref(), request, Reply::service_down));
            let _ = tx.send(reply);
            // Dropping the runtime cancels whatever the handler spawned.
        });

    if let Err(e) = spawned {
        tracing::error!("Ephemeral unit {} failed to spawn: {}", action, e);
        return Reply::worker_down();
    }

    match rx.await {
        Ok(reply) => reply,
        Err(_) => {
            tracing::error!("Ephemeral unit {} died before replying", action);
            Reply::worker_down()
        }
    }
}
