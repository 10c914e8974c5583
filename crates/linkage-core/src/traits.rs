//! Core traits for linkage abstractions.
//!
//! These traits define the collaborators the orchestrator depends on, enabling
//! pluggable backends (PostgreSQL or in-memory stores, real or fake engines)
//! and testability.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::events::{ChannelKey, JobEvent};
use crate::models::*;

// =============================================================================
// DURABLE STORE
// =============================================================================

/// Repository for graph (job) records.
#[async_trait]
pub trait GraphRepository: Send + Sync {
    /// Insert a new graph.
    async fn insert(&self, graph: &Graph) -> Result<()>;

    /// Get a graph by id. Missing ids yield `Error::GraphNotFound`.
    async fn get(&self, id: Uuid) -> Result<Graph>;

    /// Overwrite the stored graph with the given state.
    async fn save(&self, graph: &Graph) -> Result<()>;

    /// Delete a graph and its results. Returns whether a row was removed.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// List a user's graphs, newest first.
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Graph>>;
}

/// Repository for per-cell processing results.
#[async_trait]
pub trait ResultRepository: Send + Sync {
    /// Insert a result unless one already exists for its `(graph, cell)`.
    ///
    /// Returns `true` when a row was written. Existing rows are immutable.
    async fn insert(&self, result: &ProcessingResult) -> Result<bool>;

    /// Result of one grid cell.
    async fn get_cell(&self, graph_id: Uuid, cell: GridCell) -> Result<Option<ProcessingResult>>;

    /// Highest-`crit` result of a graph.
    async fn best_for_graph(&self, graph_id: Uuid) -> Result<Option<ProcessingResult>>;

    /// All results of a graph ordered by cell.
    async fn list_for_graph(&self, graph_id: Uuid) -> Result<Vec<ProcessingResult>>;

    /// Number of results stored for a graph.
    async fn count_for_graph(&self, graph_id: Uuid) -> Result<i64>;
}

// =============================================================================
// TASK QUEUE
// =============================================================================

/// Enqueue-with-arguments primitive executed at-least-once by some worker.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Queue a task. Returns its id.
    async fn enqueue(&self, args: TaskArgs) -> Result<Uuid>;

    /// Claim the next pending task whose kind is in `kinds`.
    /// An empty slice means "claim any kind".
    async fn claim_next_for_kinds(&self, kinds: &[TaskKind]) -> Result<Option<Task>>;

    /// Mark a task as completed.
    async fn complete(&self, task_id: Uuid) -> Result<()>;

    /// Mark a task as failed. The task returns to pending while
    /// `retry_count < max_retries`.
    async fn fail(&self, task_id: Uuid, error: &str) -> Result<()>;

    /// Get a task by id.
    async fn get(&self, task_id: Uuid) -> Result<Option<Task>>;

    /// Number of pending tasks.
    async fn pending_count(&self) -> Result<i64>;
}

// =============================================================================
// EXTERNAL COLLABORATORS
// =============================================================================

/// Fetches raw links for one connector method.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Connector method name (`"hal_search"`, `"pubmed_citations"`, ...).
    fn method(&self) -> &str;

    /// Fetch links for the forwarded parameters.
    async fn fetch(&self, params: &serde_json::Map<String, serde_json::Value>) -> Result<RawLinks>;
}

/// Turns raw links into the structured graph fields.
pub trait GraphParser: Send + Sync {
    fn parse(&self, links: &RawLinks, options: &ImportOptions, directed: bool) -> Result<ParsedGraph>;
}

/// One progress callback of the graph engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    /// Engine log so far.
    pub log: String,
    /// Units completed, counting repeats.
    pub units_done: u64,
    pub message: String,
}

/// Handle the engine uses to report progress.
///
/// Cloneable and usable from any thread; reports are queued to a single
/// consumer, so concurrent callers never interleave writes to job state.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<ProgressReport>,
}

impl ProgressSink {
    /// Create a sink and the receiver that drains it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A sink whose reports go nowhere.
    pub fn detached() -> Self {
        Self::channel().0
    }

    /// Report one completed unit. Returns `false` once the consumer is gone.
    pub fn report(&self, log: impl Into<String>, units_done: u64, message: impl Into<String>) -> bool {
        self.tx
            .send(ProgressReport {
                log: log.into(),
                units_done,
                message: message.into(),
            })
            .is_ok()
    }
}

/// Evaluates the full grid of a job.
#[async_trait]
pub trait GraphEngine: Send + Sync {
    async fn process(&self, request: EngineRequest, progress: ProgressSink) -> Result<EngineOutput>;
}

/// Best-effort publish-only notification channel keyed by user.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn publish(&self, key: &ChannelKey, event: &JobEvent) -> Result<()>;
}
