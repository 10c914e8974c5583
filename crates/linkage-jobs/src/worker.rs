//! Task worker: claims queued stage tasks and runs their handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use linkage_core::{defaults, Error, Result, Task, TaskKind, TaskQueue};

use crate::handler::{TaskContext, TaskHandler, TaskResult};

/// Configuration for the task worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum number of concurrent tasks.
    pub max_concurrent_tasks: usize,
    /// Hard limit for one task.
    pub task_timeout: Duration,
    /// Whether to enable task processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::TASK_POLL_INTERVAL_MS,
            max_concurrent_tasks: defaults::TASK_MAX_CONCURRENT,
            task_timeout: Duration::from_secs(defaults::TASK_TIMEOUT_SECS),
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `LINKAGE_WORKER_ENABLED` | `true` | Enable/disable task processing |
    /// | `LINKAGE_WORKER_MAX_CONCURRENT` | `4` | Max concurrent tasks |
    /// | `LINKAGE_WORKER_POLL_INTERVAL_MS` | `500` | Polling interval when queue is empty |
    pub fn from_env() -> Self {
        let enabled = std::env::var("LINKAGE_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_tasks = std::env::var("LINKAGE_WORKER_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::TASK_MAX_CONCURRENT)
            .max(1);

        let poll_interval_ms = std::env::var("LINKAGE_WORKER_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::TASK_POLL_INTERVAL_MS);

        Self {
            poll_interval_ms,
            max_concurrent_tasks,
            enabled,
            ..Self::default()
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the task worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    TaskStarted { task_id: Uuid, kind: TaskKind },
    TaskCompleted { task_id: Uuid, kind: TaskKind },
    TaskFailed {
        task_id: Uuid,
        kind: TaskKind,
        error: String,
    },
    WorkerStarted,
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Signal the worker to shut down once its current batch finishes.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

type HandlerMap = Arc<RwLock<HashMap<TaskKind, Arc<dyn TaskHandler>>>>;

/// Worker that processes stage tasks from the queue.
pub struct TaskWorker {
    queue: Arc<dyn TaskQueue>,
    config: WorkerConfig,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkerEvent>,
    wake: Option<Arc<Notify>>,
}

impl TaskWorker {
    pub fn new(queue: Arc<dyn TaskQueue>, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            queue,
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            wake: None,
        }
    }

    /// Cut the idle sleep short when `notify` fires (queue enqueue signal).
    pub fn with_wake(mut self, notify: Arc<Notify>) -> Self {
        self.wake = Some(notify);
        self
    }

    /// Register a handler for its task kind.
    pub async fn register_handler(&self, handler: Arc<dyn TaskHandler>) {
        let kind = handler.kind();
        self.handlers.write().await.insert(kind, handler);
        debug!(?kind, "Registered task handler");
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    /// Claims up to `max_concurrent_tasks` at a time and runs them
    /// concurrently. Sleeps only when the queue is empty.
    #[instrument(skip(self, shutdown_rx))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Task worker is disabled, not starting");
            return;
        }

        info!(
            subsystem = "jobs",
            component = "worker",
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent_tasks,
            "Task worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Task worker received shutdown signal");
                break;
            }

            let mut claimed = 0;
            let mut running = tokio::task::JoinSet::new();
            for _ in 0..self.config.max_concurrent_tasks {
                match self.claim_task().await {
                    Some(task) => {
                        claimed += 1;
                        let runner = self.runner();
                        running.spawn(async move { runner.execute_task(task).await });
                    }
                    None => break,
                }
            }

            if claimed == 0 {
                let wake = self.wake.clone();
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Task worker received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                    _ = async {
                        match wake {
                            Some(notify) => notify.notified().await,
                            None => std::future::pending().await,
                        }
                    } => {}
                }
            } else {
                debug!(claimed, "Processing concurrent task batch");
                while let Some(result) = running.join_next().await {
                    if let Err(e) = result {
                        error!(error = ?e, "Task panicked");
                    }
                }
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Task worker stopped");
    }

    async fn claim_task(&self) -> Option<Task> {
        let kinds: Vec<TaskKind> = self.handlers.read().await.keys().copied().collect();
        if kinds.is_empty() {
            return None;
        }

        match self.queue.claim_next_for_kinds(&kinds).await {
            Ok(task) => task,
            Err(e) => {
                error!(error = %e, "Failed to claim task");
                None
            }
        }
    }

    fn runner(&self) -> TaskRunner {
        TaskRunner {
            queue: self.queue.clone(),
            handlers: self.handlers.clone(),
            event_tx: self.event_tx.clone(),
            timeout: self.config.task_timeout,
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    pub async fn pending_count(&self) -> Result<i64> {
        self.queue.pending_count().await
    }
}

/// What a spawned task needs to run one claimed task.
struct TaskRunner {
    queue: Arc<dyn TaskQueue>,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkerEvent>,
    timeout: Duration,
}

impl TaskRunner {
    async fn execute_task(self, task: Task) {
        let start = Instant::now();
        let task_id = task.id;
        let kind = task.kind();
        let graph_id = task.args.graph_id();

        info!(
            subsystem = "jobs",
            component = "worker",
            %task_id,
            task_kind = kind.as_str(),
            %graph_id,
            retry_count = task.retry_count,
            "Processing task"
        );
        let _ = self.event_tx.send(WorkerEvent::TaskStarted { task_id, kind });

        let handler = self.handlers.read().await.get(&kind).cloned();
        let result = match handler {
            Some(handler) => {
                match tokio::time::timeout(self.timeout, handler.execute(TaskContext::new(task)))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(%task_id, task_kind = kind.as_str(), "Task exceeded timeout of {}s", self.timeout.as_secs());
                        TaskResult::Failed(format!(
                            "Task exceeded timeout of {}s",
                            self.timeout.as_secs()
                        ))
                    }
                }
            }
            None => {
                warn!(task_kind = kind.as_str(), "No handler registered for task kind");
                TaskResult::Failed(format!("No handler for task kind: {}", kind.as_str()))
            }
        };

        match result {
            TaskResult::Success(outcome) => {
                if let Err(e) = self.queue.complete(task_id).await {
                    error!(error = %e, %task_id, "Failed to mark task as completed");
                } else {
                    info!(
                        subsystem = "jobs",
                        component = "worker",
                        %task_id,
                        task_kind = kind.as_str(),
                        ?outcome,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Task completed"
                    );
                    let _ = self
                        .event_tx
                        .send(WorkerEvent::TaskCompleted { task_id, kind });
                }
            }
            TaskResult::Failed(error) => {
                if let Err(e) = self.queue.fail(task_id, &error).await {
                    error!(error = %e, %task_id, "Failed to mark task as failed");
                } else {
                    warn!(
                        subsystem = "jobs",
                        component = "worker",
                        %task_id,
                        task_kind = kind.as_str(),
                        %error,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Task failed"
                    );
                    let _ = self.event_tx.send(WorkerEvent::TaskFailed {
                        task_id,
                        kind,
                        error,
                    });
                }
            }
        }
    }
}

/// Builder for creating a task worker with handlers.
pub struct WorkerBuilder {
    queue: Arc<dyn TaskQueue>,
    config: WorkerConfig,
    handlers: Vec<Arc<dyn TaskHandler>>,
    wake: Option<Arc<Notify>>,
}

impl WorkerBuilder {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            queue,
            config: WorkerConfig::default(),
            handlers: Vec::new(),
            wake: None,
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_handlers(mut self, handlers: impl IntoIterator<Item = Arc<dyn TaskHandler>>) -> Self {
        self.handlers.extend(handlers);
        self
    }

    pub fn with_wake(mut self, notify: Arc<Notify>) -> Self {
        self.wake = Some(notify);
        self
    }

    /// Build and return the worker.
    pub async fn build(self) -> TaskWorker {
        let mut worker = TaskWorker::new(self.queue, self.config);
        worker.wake = self.wake;
        for handler in self.handlers {
            worker.register_handler(handler).await;
        }
        worker
    }
}
