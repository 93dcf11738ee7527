//! Background worker for periodic and on-demand tasks.
//!
//! Provides a generic `BackgroundWorker<R>` that processes tasks from an mpsc channel
//! via a `BackgroundRunnable` implementation, with periodic tick callbacks. Used for
//! file polling, queue consumption, registry health checks and the metrics sweep.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Trait for task handlers executed by `BackgroundWorker`.
///
/// Implementors define how individual tasks are processed, what happens on each
/// periodic tick, and how to clean up on shutdown. Implementations log their own
/// errors; a panicking iteration is caught and logged by the worker.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called periodically (on each tick interval). Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// WorkerSchedule
// ---------------------------------------------------------------------------

/// When a worker's `on_tick` fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSchedule {
    /// Time between ticks.
    pub interval: Duration,
    /// Time before the first tick.
    pub initial_delay: Duration,
}

impl WorkerSchedule {
    /// First tick after one full interval.
    #[must_use]
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            initial_delay: interval,
        }
    }

    /// First tick right after start.
    #[must_use]
    pub fn immediate(interval: Duration) -> Self {
        Self {
            interval,
            initial_delay: Duration::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Generic background worker that processes tasks via an mpsc channel.
///
/// The worker spawns a tokio task that:
/// 1. Listens for tasks on the mpsc channel
/// 2. Calls `BackgroundRunnable::run()` for each task
/// 3. Calls `BackgroundRunnable::on_tick()` on the configured schedule
/// 4. Calls `BackgroundRunnable::shutdown()` when stopped
pub struct BackgroundWorker<R: BackgroundRunnable> {
    name: String,
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Start the background worker with the given runnable and schedule.
    ///
    /// The task channel capacity is fixed at 256.
    pub fn start(name: impl Into<String>, mut runnable: R, schedule: WorkerSchedule) -> Self {
        let name = name.into();
        let (tx, mut rx) = mpsc::channel::<R::Task>(256);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let worker_name = name.clone();

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + schedule.initial_delay;
            let mut tick_interval = tokio::time::interval_at(start, schedule.interval);
            tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => {
                                let outcome = AssertUnwindSafe(runnable.run(t)).catch_unwind().await;
                                if outcome.is_err() {
                                    tracing::error!(worker = %worker_name, "task panicked; worker continues");
                                }
                            }
                            None => break, // Channel closed.
                        }
                    }
                    _ = tick_interval.tick() => {
                        let outcome = AssertUnwindSafe(runnable.on_tick()).catch_unwind().await;
                        if outcome.is_err() {
                            tracing::error!(worker = %worker_name, "tick panicked; worker continues");
                        }
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
            tracing::debug!(worker = %worker_name, "background worker stopped");
        });

        Self {
            name,
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker has not been stopped yet.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Submit a task to the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped or the channel is closed.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker {} channel closed", self.name)),
            None => Err(anyhow::anyhow!("worker {} not running", self.name)),
        }
    }

    /// Stop the worker, waiting up to `grace` for it to finish.
    ///
    /// Returns `true` on a clean stop. If the grace period expires the task
    /// is aborted and `false` is returned. Stopping twice is a no-op.
    pub async fn stop(&mut self, grace: Duration) -> bool {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        let Some(mut handle) = self.handle.take() else {
            return true;
        };
        if let Ok(joined) = tokio::time::timeout(grace, &mut handle).await {
            if joined.is_err() {
                tracing::warn!(worker = %self.name, "worker task ended abnormally");
            }
            true
        } else {
            tracing::warn!(worker = %self.name, grace_ms = grace.as_millis(), "worker did not stop in time; aborting");
            handle.abort();
            false
        }
    }
}

impl<R: BackgroundRunnable> Drop for BackgroundWorker<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
