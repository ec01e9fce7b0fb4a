//! Correlation of asynchronous replies with their awaiting callers.
//!
//! A call that crosses a thread, process or node boundary [`issue`]s a
//! pending entry, ships the generated task id with its frame and awaits the
//! returned [`Pending`]. Whoever receives the matching reply calls
//! [`resolve`] or [`reject`] with the echoed id. Entries are evicted on
//! timeout, on caller cancellation, and in bulk when their owner (a pooled
//! unit or a member node) dies.
//!
//! [`issue`]: CorrelationTable::issue
//! [`resolve`]: CorrelationTable::resolve
//! [`reject`]: CorrelationTable::reject

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};

use crate::types::{Error, Result, TaskId};

struct Entry<T> {
    owner: String,
    tx: oneshot::Sender<Result<T>>,
}

type Entries<T> = Arc<Mutex<HashMap<String, Entry<T>>>>;

/// Table of in-flight tasks keyed by generated task id.
pub struct CorrelationTable<T> {
    name: &'static str,
    timeout: Duration,
    entries: Entries<T>,
}

impl<T> Clone for CorrelationTable<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            timeout: self.timeout,
            entries: self.entries.clone(),
        }
    }
}

impl<T> fmt::Debug for CorrelationTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("pending", &self.entries.lock().len())
            .finish()
    }
}

impl<T: Send + 'static> CorrelationTable<T> {
    pub fn new(name: &'static str, timeout: Duration) -> Self {
        Self {
            name,
            timeout,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a new pending task owned by `owner`.
    pub fn issue(&self, owner: &str) -> Pending<T> {
        let id = TaskId::new();
        let (tx, rx) = oneshot::channel();
        self.entries.lock().insert(
            id.as_str().to_string(),
            Entry {
                owner: owner.to_string(),
                tx,
            },
        );
        Pending {
            rx,
            timeout: self.timeout,
            name: self.name,
            guard: EvictOnDrop {
                id,
                entries: self.entries.clone(),
            },
        }
    }

    /// Complete a task. Returns `false` for unknown (or already evicted) ids.
    pub fn resolve(&self, id: &str, value: T) -> bool {
        self.complete(id, Ok(value))
    }

    /// Fail a task. Returns `false` for unknown (or already evicted) ids.
    pub fn reject(&self, id: &str, err: Error) -> bool {
        self.complete(id, Err(err))
    }

    /// Fail every task owned by `owner`, e.g. when its channel died.
    pub fn reject_owner(&self, owner: &str, reason: &str) -> usize {
        let drained: Vec<Entry<T>> = {
            let mut entries = self.entries.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.owner == owner)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };

        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(Error::channel_closed(reason.to_string())));
        }
        if count > 0 {
            tracing::warn!("{}: rejected {} pending task(s) of {}: {}", self.name, count, owner, reason);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn complete(&self, id: &str, result: Result<T>) -> bool {
        let entry = self.entries.lock().remove(id);
        match entry {
            Some(entry) => {
                // The caller may have given up between removal and send.
                let _ = entry.tx.send(result);
                true
            }
            None => {
                tracing::warn!("{}: missing pending task {}", self.name, id);
                false
            }
        }
    }
}

/// Awaitable half of an issued task.
#[must_use = "a pending task does nothing unless awaited"]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T>>,
    timeout: Duration,
    name: &'static str,
    guard: EvictOnDrop<T>,
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("id", &self.guard.id)
            .field("table", &self.name)
            .finish()
    }
}

impl<T> Pending<T> {
    pub fn id(&self) -> &TaskId {
        &self.guard.id
    }

    /// Await the reply, the rejection, or the timeout (whichever is first).
    pub async fn wait(self) -> Result<T> {
        let Pending {
            rx,
            timeout: limit,
            name,
            guard,
        } = self;
        match timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::cancelled(format!("{}: task {} dropped", name, guard.id))),
            Err(_) => Err(Error::timeout(format!(
                "{}: task {} got no reply within {:?}",
                name, guard.id, limit
            ))),
        }
        // `guard` drops here and evicts the entry if it is still present.
    }
}

struct EvictOnDrop<T> {
    id: TaskId,
    entries: Entries<T>,
}

impl<T> Drop for EvictOnDrop<T> {
    fn drop(&mut self) {
        self.entries.lock().remove(self.id.as_str());
    }
}
