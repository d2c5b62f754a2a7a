//! Ownership of background pipeline tasks.
//!
//! Every stage that outlives the request that triggered it is spawned here,
//! so shutdown can wait for running work and abort whatever is left.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;

/// How shutdown went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that finished within the grace period
    pub completed: usize,
    /// Tasks aborted after the grace period
    pub aborted: usize,
}

/// Tracks spawned tasks and broadcasts the shutdown signal.
#[derive(Debug)]
pub struct TaskSupervisor {
    tasks: Mutex<JoinSet<()>>,
    shutdown: watch::Sender<bool>,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSupervisor {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            tasks: Mutex::new(JoinSet::new()),
            shutdown,
        }
    }

    /// Spawns a tracked task. Finished tasks are reaped on each call.
    pub fn spawn<F>(&self, name: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if *self.shutdown.borrow() {
            tracing::warn!("Not starting {} during shutdown", name);
            return;
        }

        let mut tasks = self.tasks.lock();
        while let Some(result) = tasks.try_join_next() {
            log_join_result(result);
        }
        tasks.spawn(task.instrument(tracing::info_span!("task", name = %name)));
    }

    /// Receiver that flips to `true` when shutdown starts.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Tasks spawned and not yet reaped.
    pub fn active_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Signals shutdown, waits up to `grace` for tasks to finish, then
    /// aborts the rest.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.shutdown.send_replace(true);
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let mut report = ShutdownReport::default();

        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                log_join_result(result);
                report.completed += 1;
            }
        })
        .await;

        if drained.is_err() {
            report.aborted = tasks.len();
            tracing::warn!("Aborting {} tasks still running after {:?}", report.aborted, grace);
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        tracing::info!(
            "Shutdown complete: {} tasks finished, {} aborted",
            report.completed,
            report.aborted
        );
        report
    }
}

fn log_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            tracing::error!("Pipeline task panicked: {}", e);
        } else if !e.is_cancelled() {
            tracing::warn!("Pipeline task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_shutdown_waits_for_tasks() {
        let supervisor = TaskSupervisor::new();
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let finished = finished.clone();
            supervisor.spawn("short", async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }

        let report = supervisor.shutdown(Duration::from_secs(5)).await;

        assert_eq!(report, ShutdownReport { completed: 3, aborted: 0 });
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stragglers() {
        let supervisor = TaskSupervisor::new();
        supervisor.spawn("stuck", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let report = supervisor.shutdown(Duration::from_millis(20)).await;

        assert_eq!(report.aborted, 1);
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test]
    async fn test_tasks_observe_shutdown_signal() {
        let supervisor = TaskSupervisor::new();
        let mut signal = supervisor.shutdown_signal();
        supervisor.spawn("listener", async move {
            let _ = signal.changed().await;
        });

        let report = supervisor.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.completed, 1);

        // Nothing new starts once shutdown began
        supervisor.spawn("late", async {});
        assert_eq!(supervisor.active_count(), 0);
        assert!(supervisor.is_shutting_down());
    }
}
