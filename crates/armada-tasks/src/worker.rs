//! Task worker loop.
//!
//! Drains the durable queue, performs the `queued → processing` pickup,
//! runs the handler with log sinks and a cancellation monitor, and records
//! the outcome per the error taxonomy: domain errors become
//! `{code, description}` results, non-domain errors are logged to the
//! debug stream with their chain and summarized in the result.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use armada_core::DirectorError;
use armada_state::{QueueEntry, TaskState};
use armada_workers::CancelToken;

use crate::handler::{HandlerRegistry, TaskContext};
use crate::logger::TaskLogger;
use crate::manager::TaskManager;

pub struct TaskWorker;

impl TaskWorker {
    /// Spawn one worker loop. Several can share the manager; the durable
    /// pop hands each entry to exactly one of them.
    pub fn spawn(
        manager: TaskManager,
        registry: Arc<HandlerRegistry>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let notify = manager.notifier();
        tokio::spawn(async move {
            loop {
                // Drain everything available, then park.
                loop {
                    let entry = match manager.store().dequeue_task() {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "task queue pop failed");
                            break;
                        }
                    };
                    process(&manager, &registry, entry).await;
                }

                tokio::select! {
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = shutdown.changed() => {
                        info!("task worker shutting down");
                        return;
                    }
                }
            }
        })
    }
}

async fn process(manager: &TaskManager, registry: &HandlerRegistry, entry: QueueEntry) {
    let store = manager.store();
    let task = match store.get_task(entry.task_id) {
        Ok(Some(task)) => task,
        Ok(None) => {
            warn!(task_id = entry.task_id, "queue entry without task row, discarded");
            return;
        }
        Err(e) => {
            warn!(task_id = entry.task_id, error = %e, "task row unreadable");
            return;
        }
    };

    // Exactly-once pickup.
    let picked = store
        .compare_and_set_task_state(entry.task_id, TaskState::Queued, TaskState::Processing)
        .unwrap_or(false);
    if !picked {
        // Cancelled while still queued → straight to terminal.
        if task.state == TaskState::Cancelling {
            let _ = store.finish_task(entry.task_id, TaskState::Cancelled, "task cancelled");
            info!(task_id = entry.task_id, "task cancelled before pickup");
        } else {
            warn!(task_id = entry.task_id, state = %task.state, "stale queue entry discarded");
        }
        return;
    }
    info!(task_id = entry.task_id, kind = %entry.kind, "task picked up");

    let output_dir = PathBuf::from(task.output_dir.clone().unwrap_or_default());
    let logger = match TaskLogger::create(&output_dir) {
        Ok(logger) => Arc::new(logger),
        Err(e) => {
            error!(task_id = entry.task_id, error = %e, "task log directory unusable");
            let _ = store.finish_task(
                entry.task_id,
                TaskState::Error,
                &format!("task log directory unusable: {e}"),
            );
            return;
        }
    };

    // Cancellation monitor: flips the token when the API sets `cancelling`.
    let cancel = CancelToken::new();
    let monitor = {
        let store = store.clone();
        let cancel = cancel.clone();
        let task_id = entry.task_id;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                match store.get_task(task_id) {
                    Ok(Some(task)) if task.state == TaskState::Cancelling => {
                        cancel.trip();
                        return;
                    }
                    Ok(Some(task)) if task.state.is_terminal() => return,
                    Ok(_) => {}
                    Err(_) => return,
                }
            }
        })
    };

    let outcome = match registry.get(&entry.kind) {
        Some(handler) => {
            handler
                .run(TaskContext {
                    task_id: entry.task_id,
                    payload: entry.payload.clone(),
                    logger: Arc::clone(&logger),
                    cancel: cancel.clone(),
                })
                .await
        }
        None => Err(anyhow::anyhow!("no handler registered for {}", entry.kind)),
    };
    monitor.abort();

    match outcome {
        Ok(result) => {
            let _ = logger.write_result(&result);
            let _ = store.finish_task(entry.task_id, TaskState::Done, &result);
            info!(task_id = entry.task_id, "task done");
        }
        Err(err) => match err.downcast::<DirectorError>() {
            Ok(DirectorError::Cancelled) => {
                let _ = logger.write_result("task cancelled");
                let _ = store.finish_task(entry.task_id, TaskState::Cancelled, "task cancelled");
                info!(task_id = entry.task_id, "task cancelled");
            }
            Ok(domain) => {
                let body = serde_json::json!({
                    "code": domain.code(),
                    "description": domain.to_string(),
                })
                .to_string();
                logger.debug(&format!("task failed: {domain}"));
                let _ = logger.write_result(&body);
                let _ = store.finish_task(entry.task_id, TaskState::Error, &body);
                warn!(task_id = entry.task_id, error = %domain, "task failed");
            }
            Err(other) => {
                // Non-domain failure: full chain to the debug stream,
                // summary to the result.
                logger.debug(&format!("task failed: {other:?}"));
                let summary = format!("error: {other}");
                let _ = logger.write_result(&summary);
                let _ = store.finish_task(entry.task_id, TaskState::Error, &summary);
                error!(task_id = entry.task_id, error = %other, "task failed unexpectedly");
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::TaskHandler;
    use armada_state::{StateStore, TaskKind};
    use async_trait::async_trait;
    use serde_json::json;

    struct Succeeds;
    #[async_trait]
    impl TaskHandler for Succeeds {
        async fn run(&self, ctx: TaskContext) -> anyhow::Result<String> {
            ctx.logger.debug("working");
            Ok(format!("done: {}", ctx.payload["name"].as_str().unwrap_or("")))
        }
    }

    struct FailsDomain;
    #[async_trait]
    impl TaskHandler for FailsDomain {
        async fn run(&self, _ctx: TaskContext) -> anyhow::Result<String> {
            Err(DirectorError::not_found("release", "redis").into())
        }
    }

    struct WaitsForCancel;
    #[async_trait]
    impl TaskHandler for WaitsForCancel {
        async fn run(&self, ctx: TaskContext) -> anyhow::Result<String> {
            loop {
                ctx.cancel.check()?;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    fn setup(registry: HandlerRegistry) -> (TaskManager, watch::Sender<bool>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        let manager = TaskManager::new(store, dir.path().join("tasks"));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        TaskWorker::spawn(manager.clone(), Arc::new(registry), shutdown_rx);
        (manager, shutdown_tx, dir)
    }

    async fn wait_terminal(manager: &TaskManager, id: u64) -> armada_state::TaskRecord {
        for _ in 0..100 {
            let task = manager.store().get_task(id).unwrap().unwrap();
            if task.state.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn successful_task_records_result() {
        let mut registry = HandlerRegistry::new();
        registry.insert(TaskKind::UpdateRelease, Arc::new(Succeeds) as _);
        let (manager, _shutdown, _dir) = setup(registry);

        let task = manager
            .create(TaskKind::UpdateRelease, "create release", json!({"name": "redis"}))
            .unwrap();
        let finished = wait_terminal(&manager, task.id).await;

        assert_eq!(finished.state, TaskState::Done);
        assert_eq!(finished.result.as_deref(), Some("done: redis"));

        let dir = PathBuf::from(finished.output_dir.unwrap());
        assert_eq!(std::fs::read_to_string(dir.join("result")).unwrap(), "done: redis");
        assert!(std::fs::read_to_string(dir.join("debug")).unwrap().contains("working"));
    }

    #[tokio::test]
    async fn domain_failure_writes_code_and_description() {
        let mut registry = HandlerRegistry::new();
        registry.insert(TaskKind::DeleteRelease, Arc::new(FailsDomain) as _);
        let (manager, _shutdown, _dir) = setup(registry);

        let task = manager
            .create(TaskKind::DeleteRelease, "delete release", json!({}))
            .unwrap();
        let finished = wait_terminal(&manager, task.id).await;

        assert_eq!(finished.state, TaskState::Error);
        let body: serde_json::Value =
            serde_json::from_str(finished.result.as_deref().unwrap()).unwrap();
        assert_eq!(body["code"], 10001);
        assert!(body["description"].as_str().unwrap().contains("redis"));
    }

    #[tokio::test]
    async fn missing_handler_is_an_error() {
        let (manager, _shutdown, _dir) = setup(HandlerRegistry::new());
        let task = manager
            .create(TaskKind::UpdateStemcell, "upload stemcell", json!({}))
            .unwrap();
        let finished = wait_terminal(&manager, task.id).await;
        assert_eq!(finished.state, TaskState::Error);
        assert!(finished.result.unwrap().contains("no handler"));
    }

    #[tokio::test]
    async fn running_task_cancels_cooperatively() {
        let mut registry = HandlerRegistry::new();
        registry.insert(TaskKind::UpdateDeployment, Arc::new(WaitsForCancel) as _);
        let (manager, _shutdown, _dir) = setup(registry);

        let task = manager
            .create(TaskKind::UpdateDeployment, "deploy", json!({}))
            .unwrap();
        // Give the worker a moment to pick it up.
        for _ in 0..50 {
            let state = manager.store().get_task(task.id).unwrap().unwrap().state;
            if state == TaskState::Processing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        manager.cancel(task.id).unwrap();
        let finished = wait_terminal(&manager, task.id).await;
        assert_eq!(finished.state, TaskState::Cancelled);
        assert_eq!(finished.result.as_deref(), Some("task cancelled"));
    }

    #[tokio::test]
    async fn task_cancelled_while_queued_never_runs() {
        // No worker: cancel first, then start one.
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        let manager = TaskManager::new(store, dir.path().join("tasks"));

        let task = manager
            .create(TaskKind::UpdateDeployment, "deploy", json!({}))
            .unwrap();
        manager.cancel(task.id).unwrap();

        let mut registry = HandlerRegistry::new();
        registry.insert(TaskKind::UpdateDeployment, Arc::new(Succeeds) as _);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        TaskWorker::spawn(manager.clone(), Arc::new(registry), shutdown_rx);

        let finished = wait_terminal(&manager, task.id).await;
        assert_eq!(finished.state, TaskState::Cancelled);
    }
}
