//! In-memory store implementing the repository and queue traits.
//!
//! Used by tests and by embedders without PostgreSQL. Semantics mirror the
//! PostgreSQL repositories: result rows are unique per `(graph, cell)`,
//! deleting a graph cascades to its results, and failed tasks return to
//! pending while they have retries left.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use linkage_core::{
    defaults, Error, Graph, GraphRepository, GridCell, ProcessingResult, Result,
    ResultRepository, Task, TaskArgs, TaskKind, TaskQueue, TaskStatus,
};

#[derive(Default)]
struct Tables {
    graphs: HashMap<Uuid, Graph>,
    results: HashMap<Uuid, BTreeMap<GridCell, ProcessingResult>>,
    tasks: BTreeMap<Uuid, Task>,
}

/// Shared in-memory tables. Clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    notify: Arc<Notify>,
    max_retries: i32,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            notify: Arc::new(Notify::new()),
            max_retries: defaults::TASK_MAX_RETRIES,
        }
    }

    /// Override the retry budget of newly enqueued tasks.
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Notification handle signalled on every enqueue.
    pub fn task_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Every task ever enqueued, oldest first.
    pub async fn tasks(&self) -> Vec<Task> {
        let tables = self.tables.lock().await;
        let mut tasks: Vec<Task> = tables.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }
}

#[async_trait]
impl GraphRepository for MemoryStore {
    async fn insert(&self, graph: &Graph) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.graphs.contains_key(&graph.id) {
            return Err(Error::InvalidInput(format!("graph {} already exists", graph.id)));
        }
        tables.graphs.insert(graph.id, graph.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Graph> {
        let tables = self.tables.lock().await;
        tables.graphs.get(&id).cloned().ok_or(Error::GraphNotFound(id))
    }

    async fn save(&self, graph: &Graph) -> Result<()> {
        let mut tables = self.tables.lock().await;
        match tables.graphs.get_mut(&graph.id) {
            Some(stored) => {
                *stored = graph.clone();
                stored.updated_at = Utc::now();
                Ok(())
            }
            None => Err(Error::GraphNotFound(graph.id)),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        tables.results.remove(&id);
        Ok(tables.graphs.remove(&id).is_some())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Graph>> {
        let tables = self.tables.lock().await;
        let mut graphs: Vec<Graph> = tables
            .graphs
            .values()
            .filter(|g| g.user_id == user_id)
            .cloned()
            .collect();
        graphs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(graphs)
    }
}

#[async_trait]
impl ResultRepository for MemoryStore {
    async fn insert(&self, result: &ProcessingResult) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        if !tables.graphs.contains_key(&result.graph_id) {
            return Err(Error::GraphNotFound(result.graph_id));
        }
        let rows = tables.results.entry(result.graph_id).or_default();
        if rows.contains_key(&result.cell) {
            return Ok(false);
        }
        rows.insert(result.cell, result.clone());
        Ok(true)
    }

    async fn get_cell(&self, graph_id: Uuid, cell: GridCell) -> Result<Option<ProcessingResult>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .results
            .get(&graph_id)
            .and_then(|rows| rows.get(&cell))
            .cloned())
    }

    async fn best_for_graph(&self, graph_id: Uuid) -> Result<Option<ProcessingResult>> {
        let tables = self.tables.lock().await;
        // Ties go to the smallest cell, as in the SQL ordering.
        Ok(tables.results.get(&graph_id).and_then(|rows| {
            rows.values()
                .fold(None::<&ProcessingResult>, |best, r| match best {
                    Some(b) if b.crit() >= r.crit() => Some(b),
                    _ => Some(r),
                })
                .cloned()
        }))
    }

    async fn list_for_graph(&self, graph_id: Uuid) -> Result<Vec<ProcessingResult>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .results
            .get(&graph_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn count_for_graph(&self, graph_id: Uuid) -> Result<i64> {
        let tables = self.tables.lock().await;
        Ok(tables.results.get(&graph_id).map(|r| r.len() as i64).unwrap_or(0))
    }
}

#[async_trait]
impl TaskQueue for MemoryStore {
    async fn enqueue(&self, args: TaskArgs) -> Result<Uuid> {
        let mut task = Task::new(args);
        task.max_retries = self.max_retries;
        let id = task.id;
        self.tables.lock().await.tasks.insert(id, task);
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn claim_next_for_kinds(&self, kinds: &[TaskKind]) -> Result<Option<Task>> {
        let mut tables = self.tables.lock().await;
        let next = tables
            .tasks
            .values_mut()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| kinds.is_empty() || kinds.contains(&t.kind()))
            .min_by_key(|t| t.created_at);

        Ok(next.map(|task| {
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            task.clone()
        }))
    }

    async fn complete(&self, task_id: Uuid) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let task = tables
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.error_message = None;
        Ok(())
    }

    async fn fail(&self, task_id: Uuid, error: &str) -> Result<()> {
        let requeued = {
            let mut tables = self.tables.lock().await;
            let task = tables
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
            task.error_message = Some(error.to_string());
            if task.retry_count < task.max_retries {
                task.retry_count += 1;
                task.status = TaskStatus::Pending;
                task.started_at = None;
                true
            } else {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(Utc::now());
                false
            }
        };
        if requeued {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(self.tables.lock().await.tasks.get(&task_id).cloned())
    }

    async fn pending_count(&self) -> Result<i64> {
        let tables = self.tables.lock().await;
        Ok(tables
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count() as i64)
    }
}
