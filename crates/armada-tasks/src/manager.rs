//! Task creation, observation and cancellation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::Notify;
use tracing::info;

use armada_state::{QueueEntry, StateStore, TaskId, TaskKind, TaskRecord, TaskState};

/// Creates durable tasks and signals workers. Cloneable; shared between
/// the API layer and the worker loops.
#[derive(Clone)]
pub struct TaskManager {
    store: StateStore,
    log_root: PathBuf,
    wake: Arc<Notify>,
}

impl TaskManager {
    pub fn new(store: StateStore, log_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            log_root: log_root.into(),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Workers park on this between queue drains.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Insert a `queued` task row, allocate its log directory, enqueue the
    /// durable entry and wake a worker. Returns the record immediately;
    /// the caller redirects to the task location.
    pub fn create(
        &self,
        kind: TaskKind,
        description: &str,
        payload: Value,
    ) -> anyhow::Result<TaskRecord> {
        let id = self.store.allocate_task_id()?;
        let output_dir = self.log_root.join(id.to_string());
        std::fs::create_dir_all(&output_dir)?;

        let task = TaskRecord {
            id,
            kind,
            state: TaskState::Queued,
            timestamp: epoch_secs(),
            description: description.to_string(),
            result: None,
            output_dir: Some(output_dir.to_string_lossy().into_owned()),
        };
        self.store.put_task(&task)?;
        self.store.enqueue_task(&QueueEntry {
            task_id: id,
            kind,
            payload,
        })?;
        self.wake.notify_one();

        info!(task_id = id, %kind, "task created");
        Ok(task)
    }

    /// Request cooperative cancellation. Returns false when the task is
    /// already terminal (nothing to cancel).
    pub fn cancel(&self, id: TaskId) -> anyhow::Result<bool> {
        for from in [TaskState::Queued, TaskState::Processing] {
            if self
                .store
                .compare_and_set_task_state(id, from, TaskState::Cancelling)?
            {
                info!(task_id = id, "task cancellation requested");
                self.wake.notify_one();
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> (TaskManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        (TaskManager::new(store, dir.path().join("tasks")), dir)
    }

    #[test]
    fn create_persists_row_queue_entry_and_directory() {
        let (manager, _dir) = manager();
        let task = manager
            .create(
                TaskKind::UpdateRelease,
                "create release",
                json!({"bundle_path": "/tmp/r.tgz"}),
            )
            .unwrap();

        assert_eq!(task.state, TaskState::Queued);
        assert!(std::path::Path::new(task.output_dir.as_ref().unwrap()).is_dir());

        let entry = manager.store.dequeue_task().unwrap().unwrap();
        assert_eq!(entry.task_id, task.id);
        assert_eq!(entry.payload["bundle_path"], "/tmp/r.tgz");
    }

    #[test]
    fn ids_increase_across_creates() {
        let (manager, _dir) = manager();
        let a = manager.create(TaskKind::UpdateRelease, "a", json!({})).unwrap();
        let b = manager.create(TaskKind::DeleteRelease, "b", json!({})).unwrap();
        assert!(b.id > a.id);
    }

    #[test]
    fn cancel_moves_queued_and_processing_to_cancelling() {
        let (manager, _dir) = manager();
        let task = manager.create(TaskKind::UpdateDeployment, "x", json!({})).unwrap();

        assert!(manager.cancel(task.id).unwrap());
        assert_eq!(
            manager.store.get_task(task.id).unwrap().unwrap().state,
            TaskState::Cancelling
        );

        // Already cancelling → nothing to do.
        assert!(!manager.cancel(task.id).unwrap());
    }

    #[test]
    fn cancel_terminal_task_is_refused() {
        let (manager, _dir) = manager();
        let task = manager.create(TaskKind::UpdateDeployment, "x", json!({})).unwrap();
        manager
            .store
            .finish_task(task.id, TaskState::Done, "done")
            .unwrap();

        assert!(!manager.cancel(task.id).unwrap());
    }
}
