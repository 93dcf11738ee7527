//! Manager lifecycle state with in-flight async-query tracking.
//!
//! State lives in an `ArcSwap` for lock-free reads; in-flight queries are
//! counted with RAII guards and their abort handles are kept so shutdown can
//! terminate stragglers once the drain timeout expires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::task::{AbortHandle, JoinHandle};

/// `Created -> Running -> Stopping -> Stopped`, and back to `Running` on a
/// fresh `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: ArcSwap<LifecycleState>,
    in_flight: Arc<AtomicU64>,
    next_id: AtomicU64,
    tasks: Arc<DashMap<u64, AbortHandle>>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(LifecycleState::Created),
            in_flight: Arc::new(AtomicU64::new(0)),
            next_id: AtomicU64::new(0),
            tasks: Arc::new(DashMap::new()),
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Moves to `Running` unless already running or stopping. Returns whether
    /// the transition happened.
    pub(crate) fn try_start(&self) -> bool {
        let previous = self.state.rcu(|current| match **current {
            LifecycleState::Created | LifecycleState::Stopped => Arc::new(LifecycleState::Running),
            other => Arc::new(other),
        });
        matches!(*previous, LifecycleState::Created | LifecycleState::Stopped)
    }

    /// Moves `Running` to `Stopping`. Any other state is left alone and
    /// `false` is returned, so only one caller ever runs the stop sequence.
    pub(crate) fn begin_stop(&self) -> bool {
        let previous = self.state.rcu(|current| {
            if **current == LifecycleState::Running {
                Arc::new(LifecycleState::Stopping)
            } else {
                Arc::clone(current)
            }
        });
        matches!(*previous, LifecycleState::Running)
    }

    pub(crate) fn set_stopped(&self) {
        self.state.store(Arc::new(LifecycleState::Stopped));
    }

    /// Counts one in-flight query until the guard drops.
    pub(crate) fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            tasks: Arc::clone(&self.tasks),
        }
    }

    /// Records the task that owns guard `id` so shutdown can cancel it.
    pub(crate) fn track<T>(&self, id: u64, task: &JoinHandle<T>) {
        self.tasks.insert(id, task.abort_handle());
        // The guard may already have dropped; don't keep a dead handle.
        if task.is_finished() {
            self.tasks.remove(&id);
        }
    }

    pub(crate) fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits for in-flight queries to finish, up to `timeout`. Queries still
    /// running afterwards are aborted and `false` is returned.
    pub(crate) async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight_count() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                let stragglers: Vec<AbortHandle> =
                    self.tasks.iter().map(|t| t.value().clone()).collect();
                self.tasks.clear();
                for task in &stragglers {
                    task.abort();
                }
                tracing::warn!(
                    remaining = stragglers.len(),
                    "async queries did not drain in time; aborted"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Decrements the in-flight counter and forgets the task handle on drop,
/// including when the query task is aborted.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
    id: u64,
    tasks: Arc<DashMap<u64, AbortHandle>>,
}

impl InFlightGuard {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tasks.remove(&self.id);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
