//! Async task manager.
//!
//! Long operations (create, clone) run detached and are observed through
//! numeric task ids. The task's `target` URI doubles as a reservation: a
//! VM name with a running task against `/vms/<name>` counts as taken even
//! though the domain is not defined yet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use verdin_hypervisor::error::{EngineError, Result};

/// Hard ceiling on any task wait.
pub const MAX_TASK_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: u64,
    pub target: String,
    pub status: TaskStatus,
    pub message: String,
}

struct TaskEntry {
    record: TaskRecord,
    done: watch::Receiver<bool>,
}

pub struct TaskManager {
    tasks: Arc<RwLock<HashMap<u64, TaskEntry>>>,
    next_id: AtomicU64,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self { tasks: Arc::new(RwLock::new(HashMap::new())), next_id: AtomicU64::new(0) }
    }

    /// Spawn a task. The future's `Ok` string becomes the success message,
    /// an `Err` marks the task failed with the error text.
    pub async fn spawn<F>(&self, target: impl Into<String>, fut: F) -> u64
    where
        F: std::future::Future<Output = Result<String>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let target = target.into();
        let (tx, rx) = watch::channel(false);
        {
            let mut tasks = self.tasks.write().await;
            tasks.insert(
                id,
                TaskEntry {
                    record: TaskRecord {
                        id,
                        target: target.clone(),
                        status: TaskStatus::Running,
                        message: String::new(),
                    },
                    done: rx,
                },
            );
        }
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            let result = fut.await;
            let mut guard = tasks.write().await;
            if let Some(entry) = guard.get_mut(&id) {
                match result {
                    Ok(message) => {
                        info!(task = id, target = %target, "task finished");
                        entry.record.status = TaskStatus::Finished;
                        entry.record.message = message;
                    }
                    Err(e) => {
                        warn!(task = id, target = %target, error = %e, "task failed");
                        entry.record.status = TaskStatus::Failed;
                        entry.record.message = e.to_string();
                    }
                }
            }
            let _ = tx.send(true);
        });
        id
    }

    pub async fn lookup(&self, id: u64) -> Option<TaskRecord> {
        self.tasks.read().await.get(&id).map(|e| e.record.clone())
    }

    /// Block until the task leaves `Running` or the timeout elapses.
    /// Timeouts are failures, never hangs; waits are capped at one hour.
    pub async fn wait(&self, id: u64, timeout: Duration) -> Result<TaskRecord> {
        let timeout = timeout.min(MAX_TASK_WAIT);
        let mut done = {
            let tasks = self.tasks.read().await;
            let entry = tasks
                .get(&id)
                .ok_or_else(|| EngineError::not_found("task", id.to_string()))?;
            entry.done.clone()
        };
        if !*done.borrow() {
            let waited = tokio::time::timeout(timeout, done.changed()).await;
            match waited {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    return Err(EngineError::failed("task wait", "task channel closed"))
                }
                Err(_) => {
                    return Err(EngineError::failed(
                        "task wait",
                        format!("task {id} did not finish within {}s", timeout.as_secs()),
                    ))
                }
            }
        }
        self.lookup(id)
            .await
            .ok_or_else(|| EngineError::not_found("task", id.to_string()))
    }

    /// Whether a running task holds this target.
    pub async fn is_target_busy(&self, target: &str) -> bool {
        self.tasks
            .read()
            .await
            .values()
            .any(|e| e.record.status == TaskStatus::Running && e.record.target == target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_are_monotonic() {
        let mgr = TaskManager::new();
        let a = mgr.spawn("/vms/a", async { Ok("done".to_string()) }).await;
        let b = mgr.spawn("/vms/b", async { Ok("done".to_string()) }).await;
        assert!(b > a);
    }

    #[tokio::test]
    async fn wait_reports_success_and_failure() {
        let mgr = TaskManager::new();
        let ok = mgr.spawn("/vms/x", async { Ok("created".to_string()) }).await;
        let record = mgr.wait(ok, Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.status, TaskStatus::Finished);
        assert_eq!(record.message, "created");

        let bad = mgr
            .spawn("/vms/y", async {
                Err(EngineError::InvalidOperation("nope".to_string()))
            })
            .await;
        let record = mgr.wait(bad, Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.message.contains("nope"));
    }

    #[tokio::test]
    async fn wait_times_out() {
        let mgr = TaskManager::new();
        let id = mgr
            .spawn("/vms/slow", async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok("done".to_string())
            })
            .await;
        let err = mgr.wait(id, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, EngineError::OperationFailed { .. }));
    }

    #[tokio::test]
    async fn target_reservation() {
        let mgr = TaskManager::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let id = mgr
            .spawn("/vms/pending", async move {
                let _ = rx.await;
                Ok("done".to_string())
            })
            .await;
        assert!(mgr.is_target_busy("/vms/pending").await);
        assert!(!mgr.is_target_busy("/vms/other").await);
        let _ = tx.send(());
        mgr.wait(id, Duration::from_secs(5)).await.unwrap();
        assert!(!mgr.is_target_busy("/vms/pending").await);
    }
}
