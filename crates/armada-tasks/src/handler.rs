//! Task handler seam.
//!
//! One handler per task kind, registered at daemon startup. Handlers
//! return the short result string on success; domain failures bubble as
//! `DirectorError` inside the `anyhow` error, anything else is a
//! non-domain failure logged with its backtrace.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use armada_state::{TaskId, TaskKind};
use armada_workers::CancelToken;

use crate::logger::TaskLogger;

/// Everything a task body needs, passed explicitly.
pub struct TaskContext {
    pub task_id: TaskId,
    pub payload: Value,
    pub logger: Arc<TaskLogger>,
    pub cancel: CancelToken,
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<String>;
}

pub type HandlerRegistry = HashMap<TaskKind, Arc<dyn TaskHandler>>;
