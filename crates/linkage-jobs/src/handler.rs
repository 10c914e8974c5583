//! Task handlers for each task kind.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use linkage_core::{Error, Result, Task, TaskArgs, TaskKind};

use crate::orchestrator::{Orchestrator, StageOutcome};

/// Context provided to task handlers.
pub struct TaskContext {
    /// The claimed task.
    pub task: Task,
}

impl TaskContext {
    pub fn new(task: Task) -> Self {
        Self { task }
    }

    pub fn task_id(&self) -> Uuid {
        self.task.id
    }

    pub fn graph_id(&self) -> Uuid {
        self.task.args.graph_id()
    }

    pub fn args(&self) -> &TaskArgs {
        &self.task.args
    }
}

/// Result of task execution.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    /// Stage ran to an outcome; the task is complete.
    Success(Option<StageOutcome>),
    /// Stage raised; the queue decides whether to retry.
    Failed(String),
}

/// Trait for task handlers.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The task kind this handler processes.
    fn kind(&self) -> TaskKind;

    /// Execute the task.
    async fn execute(&self, ctx: TaskContext) -> TaskResult;

    /// Check if this handler can process the given task kind.
    fn can_handle(&self, kind: TaskKind) -> bool {
        self.kind() == kind
    }
}

fn into_task_result(graph_id: Uuid, result: Result<StageOutcome>) -> TaskResult {
    match result {
        Ok(outcome) => TaskResult::Success(Some(outcome)),
        Err(Error::GraphNotFound(id)) => {
            // Deleted while queued; nothing left to run.
            warn!(subsystem = "jobs", component = "handler", graph_id = %id, "Graph no longer exists");
            TaskResult::Success(None)
        }
        Err(e) => {
            warn!(subsystem = "jobs", component = "handler", %graph_id, error = %e, "Stage failed");
            TaskResult::Failed(e.to_string())
        }
    }
}

fn mismatched(kind: TaskKind, args: &TaskArgs) -> TaskResult {
    TaskResult::Failed(format!(
        "{} handler received {} arguments",
        kind.as_str(),
        args.kind().as_str()
    ))
}

/// Runs the retrieving stage.
pub struct RetrieveHandler {
    orchestrator: Arc<Orchestrator>,
}

impl RetrieveHandler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl TaskHandler for RetrieveHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Retrieve
    }

    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        match ctx.task.args {
            TaskArgs::Retrieve {
                graph_id,
                method,
                params,
            } => into_task_result(
                graph_id,
                self.orchestrator.retrieve(graph_id, &method, params).await,
            ),
            ref other => mismatched(self.kind(), other),
        }
    }
}

/// Runs the importing stage of uploaded links.
pub struct ImportHandler {
    orchestrator: Arc<Orchestrator>,
}

impl ImportHandler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl TaskHandler for ImportHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Import
    }

    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        match ctx.task.args {
            TaskArgs::Import {
                graph_id,
                links,
                options,
            } => into_task_result(
                graph_id,
                self.orchestrator.import(graph_id, links, options).await,
            ),
            ref other => mismatched(self.kind(), other),
        }
    }
}

/// Runs the clustering stage.
pub struct ClusterHandler {
    orchestrator: Arc<Orchestrator>,
}

impl ClusterHandler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl TaskHandler for ClusterHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Cluster
    }

    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        match ctx.task.args {
            TaskArgs::Cluster {
                graph_id,
                seed,
                notify_delay_ms,
            } => into_task_result(
                graph_id,
                self.orchestrator
                    .cluster(graph_id, seed, Duration::from_millis(notify_delay_ms))
                    .await,
            ),
            ref other => mismatched(self.kind(), other),
        }
    }
}

/// Handlers for every task kind, sharing one orchestrator.
pub fn stage_handlers(orchestrator: Arc<Orchestrator>) -> Vec<Arc<dyn TaskHandler>> {
    vec![
        Arc::new(RetrieveHandler::new(orchestrator.clone())),
        Arc::new(ImportHandler::new(orchestrator.clone())),
        Arc::new(ClusterHandler::new(orchestrator)),
    ]
}
