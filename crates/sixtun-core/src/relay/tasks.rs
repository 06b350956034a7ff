//! Task supervision.
//!
//! Every relay task runs inside a [`TaskGroup`]. The group shares one
//! cancellation token with its tasks, can wait for all of them to finish, and
//! records how each long-lived task ended.

use crate::error::{RelayError, Result};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

/// Lifecycle of a supervised task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskHealth {
    /// Still executing
    Running,
    /// Returned normally, saw its peer close, or stopped on cancellation
    Finished,
    /// Returned an error or panicked
    Failed(String),
}

impl TaskHealth {
    /// Whether the task is still executing
    pub fn is_running(&self) -> bool {
        matches!(self, TaskHealth::Running)
    }
}

/// Spawns, cancels and joins a set of related tasks
#[derive(Clone)]
pub struct TaskGroup {
    tracker: TaskTracker,
    cancel: CancellationToken,
    health: Arc<DashMap<String, TaskHealth>>,
}

impl TaskGroup {
    /// Create a group whose tasks observe `cancel`
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel,
            health: Arc::new(DashMap::new()),
        }
    }

    /// Token shared by every task in the group
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Spawn a long-lived task whose outcome stays visible in [`TaskGroup::health`]
    pub fn spawn<F>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn_inner(name.into(), task, true);
    }

    /// Spawn a per-connection task; its entry is dropped once it ends
    pub fn spawn_ephemeral<F>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn_inner(name.into(), task, false);
    }

    fn spawn_inner<F>(&self, name: String, task: F, retain: bool)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.health.insert(name.clone(), TaskHealth::Running);
        let health = self.health.clone();

        self.tracker.spawn(async move {
            // Inner spawn so a panic surfaces as a JoinError instead of tearing down the tracker task
            let outcome = match tokio::spawn(task).await {
                Ok(Ok(()))
                | Ok(Err(RelayError::Cancelled))
                | Ok(Err(RelayError::ConnectionClosed(_))) => {
                    debug!(task = %name, "Task finished");
                    TaskHealth::Finished
                }
                Ok(Err(e)) => {
                    warn!(task = %name, error = %e, "Task failed");
                    TaskHealth::Failed(e.to_string())
                }
                Err(join_err) => {
                    error!(task = %name, error = %join_err, "Task panicked");
                    TaskHealth::Failed(format!("panicked: {join_err}"))
                }
            };

            if retain {
                health.insert(name, outcome);
            } else {
                health.remove(&name);
            }
        });
    }

    /// Snapshot of every tracked task, sorted by name
    pub fn health(&self) -> Vec<(String, TaskHealth)> {
        let mut entries: Vec<_> = self
            .health
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Health of one task, if it is tracked
    pub fn task_health(&self, name: &str) -> Option<TaskHealth> {
        self.health.get(name).map(|entry| entry.value().clone())
    }

    /// Number of tasks still executing
    pub fn running(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel every task and wait until all of them have returned
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("All tasks joined");
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("running", &self.tracker.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
