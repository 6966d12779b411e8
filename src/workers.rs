//! Long-lived task supervision
//!
//! Every loop that must be drained at shutdown is spawned through the
//! process-wide supervisor so `main` can block on `wait_all()` after the
//! relay has stopped.

use std::future::Future;
use std::sync::OnceLock;

use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::trace;

static INSTANCE: OnceLock<WorkerSupervisor> = OnceLock::new();

/// Process-wide supervisor for long-lived tasks.
pub struct WorkerSupervisor {
    tracker: TaskTracker,
}

impl WorkerSupervisor {
    /// Get the singleton supervisor.
    pub fn instance() -> &'static WorkerSupervisor {
        INSTANCE.get_or_init(|| WorkerSupervisor {
            tracker: TaskTracker::new(),
        })
    }

    /// Spawn a tagged worker. The tag is used only in logs.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        trace!(worker = name, "Added worker");
        self.tracker.spawn(async move {
            task.await;
            trace!(worker = name, "Worker done");
        })
    }

    /// Number of workers that have not finished yet.
    pub fn worker_count(&self) -> usize {
        self.tracker.len()
    }

    /// Block until every spawned worker has finished.
    pub async fn wait_all(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_all_drains_workers() {
        let supervisor = WorkerSupervisor::instance();

        let noop = supervisor.spawn("noop", async {});
        let sleeper = supervisor.spawn("sleeper", async {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        });

        supervisor.wait_all().await;
        assert!(noop.is_finished());
        assert!(sleeper.is_finished());
    }

    #[tokio::test]
    async fn test_supervisor_reusable_after_wait() {
        let supervisor = WorkerSupervisor::instance();
        supervisor.wait_all().await;

        let handle = supervisor.spawn("late", async {});
        handle.await.expect("late worker panicked");
    }
}
