//! Per-handler admission control.
//!
//! A gate with limit `n > 0` lets at most `n` calls run at once; excess
//! callers wait in a FIFO queue and are never dropped. When a call finishes
//! while others are waiting, its slot is handed to the head of the queue
//! after the settle delay. The slot moves directly from the finishing call to
//! the waiter, so the running count never exceeds the limit.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct GateState {
    running: usize,
    completed: u64,
    waiters: VecDeque<oneshot::Sender<()>>,
}

#[derive(Debug)]
struct Shared {
    limit: usize,
    settle_delay: Duration,
    state: Mutex<GateState>,
}

/// Admission gate of one handler.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    shared: Arc<Shared>,
}

impl AdmissionGate {
    /// `limit == 0` disables queueing.
    pub fn new(limit: usize, settle_delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                limit,
                settle_delay,
                state: Mutex::new(GateState::default()),
            }),
        }
    }

    /// Wait for a slot. The returned permit releases it on drop.
    pub async fn acquire(&self) -> Permit {
        loop {
            let rx = {
                let mut state = self.shared.state.lock();
                if self.shared.limit == 0 || state.running < self.shared.limit {
                    state.running += 1;
                    return Permit {
                        shared: Some(self.shared.clone()),
                    };
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };

            let mut waiting = Waiting {
                rx,
                shared: Some(self.shared.clone()),
            };
            if (&mut waiting.rx).await.is_ok() {
                // The releasing call transferred its slot to us.
                return Permit {
                    shared: waiting.shared.take(),
                };
            }
            waiting.shared = None;
        }
    }

    pub fn limit(&self) -> usize {
        self.shared.limit
    }

    pub fn running(&self) -> usize {
        self.shared.state.lock().running
    }

    pub fn queued(&self) -> usize {
        self.shared.state.lock().waiters.len()
    }

    pub fn completed(&self) -> u64 {
        self.shared.state.lock().completed
    }
}

/// A held slot.
#[derive(Debug)]
pub struct Permit {
    shared: Option<Arc<Shared>>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        {
            let mut state = shared.state.lock();
            state.completed += 1;
            if state.waiters.is_empty() {
                state.running = state.running.saturating_sub(1);
                return;
            }
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(shared.settle_delay).await;
                    hand_over(&shared);
                });
            }
            Err(_) => hand_over(&shared),
        }
    }
}

/// Give the slot to the first waiter still listening, or free it.
fn hand_over(shared: &Shared) {
    let mut state = shared.state.lock();
    while let Some(waiter) = state.waiters.pop_front() {
        if waiter.send(()).is_ok() {
            return;
        }
    }
    state.running = state.running.saturating_sub(1);
}

/// A queued caller. If it is cancelled after being handed a slot, the slot
/// is passed on.
struct Waiting {
    rx: oneshot::Receiver<()>,
    shared: Option<Arc<Shared>>,
}

impl Drop for Waiting {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            drop(Permit {
                shared: Some(shared),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_unbounded_gate_never_queues() {
        let gate = AdmissionGate::new(0, Duration::from_millis(50));
        let a = gate.acquire().await;
        let b = gate.acquire().await;
        assert_eq!(gate.running(), 2);
        drop((a, b));
        assert_eq!(gate.running(), 0);
        assert_eq!(gate.completed(), 2);
    }

    #[tokio::test]
    async fn test_limit_one_serializes_three_calls() {
        let gate = AdmissionGate::new(1, Duration::from_millis(50));
        let peak = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let gate = gate.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = gate.acquire().await;
                peak.fetch_max(gate.running(), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        // Three 100ms calls plus two 50ms settle delays.
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert_eq!(gate.running(), 0);
        assert_eq!(gate.completed(), 3);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_order() {
        let gate = AdmissionGate::new(1, Duration::from_millis(5));
        let first = gate.acquire().await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..3 {
            let gate = gate.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = gate.acquire().await;
                order.lock().push(i);
            }));
            // Let each task enqueue before spawning the next.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(gate.queued(), 3);
        drop(first);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leak_slot() {
        let gate = AdmissionGate::new(1, Duration::from_millis(5));
        let held = gate.acquire().await;

        let abandoned = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _permit = gate.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        abandoned.abort();
        let _ = abandoned.await;

        drop(held);
        let again = tokio::time::timeout(Duration::from_secs(1), gate.acquire()).await;
        assert!(again.is_ok());
    }
}
