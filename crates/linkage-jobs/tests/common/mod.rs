//! Fakes shared by the orchestrator and worker integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use linkage_db::MemoryStore;
use linkage_jobs::{
    ChannelKey, ClusteringConfig, ConnectorRegistry, EngineOutput, EngineRequest, Error, Graph,
    GraphEngine, GraphParser, GraphRepository, GridCell, ImportOptions, JobEvent, JobEventKind,
    NotificationChannel, Orchestrator, OrchestratorConfig, ParsedGraph, ProcessingResult,
    ProgressSink, RawLink, RawLinks, Result, ResultPayload, ResultRepository, RetryPolicy,
    SourceConnector, Task, TaskArgs, TaskKind, TaskQueue, TermDocumentMatrix,
};

/// Ordered record of store writes and published events.
#[derive(Default)]
pub struct Timeline(Mutex<Vec<String>>);

impl Timeline {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

// =============================================================================
// Store
// =============================================================================

type SaveFilter = Box<dyn Fn(&Graph) -> bool + Send + Sync>;

/// In-memory store whose result inserts and graph saves can be made to fail,
/// recording every successful graph save.
#[derive(Clone)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    result_failures: Arc<AtomicU32>,
    save_failures: Arc<Mutex<Option<(u32, SaveFilter)>>>,
    saves: Arc<Mutex<Vec<Graph>>>,
    timeline: Arc<Timeline>,
}

impl FlakyStore {
    pub fn new(timeline: Arc<Timeline>) -> Self {
        Self {
            inner: MemoryStore::new(),
            result_failures: Arc::new(AtomicU32::new(0)),
            save_failures: Arc::new(Mutex::new(None)),
            saves: Arc::new(Mutex::new(Vec::new())),
            timeline,
        }
    }

    /// Fail the next `n` result inserts.
    pub fn fail_next_result_inserts(&self, n: u32) {
        self.result_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` graph saves that match `when`.
    pub fn fail_graph_saves(&self, n: u32, when: impl Fn(&Graph) -> bool + Send + Sync + 'static) {
        *self.save_failures.lock().unwrap() = Some((n, Box::new(when)));
    }

    fn take_save_failure(&self, graph: &Graph) -> bool {
        let mut failures = self.save_failures.lock().unwrap();
        match failures.as_mut() {
            Some((n, when)) if *n > 0 && when(graph) => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    /// Snapshots of every successful graph save, oldest first.
    pub fn saves(&self) -> Vec<Graph> {
        self.saves.lock().unwrap().clone()
    }

    pub async fn tasks(&self) -> Vec<Task> {
        self.inner.tasks().await
    }
}

#[async_trait]
impl GraphRepository for FlakyStore {
    async fn insert(&self, graph: &Graph) -> Result<()> {
        GraphRepository::insert(&self.inner, graph).await
    }

    async fn get(&self, id: Uuid) -> Result<Graph> {
        GraphRepository::get(&self.inner, id).await
    }

    async fn save(&self, graph: &Graph) -> Result<()> {
        if self.take_save_failure(graph) {
            self.timeline.push(format!(
                "save failed progress={} step={}",
                graph.progress, graph.current_step
            ));
            return Err(Error::Internal("deadlock detected".into()));
        }
        self.inner.save(graph).await?;
        self.saves.lock().unwrap().push(graph.clone());
        self.timeline.push(format!(
            "save progress={} step={}",
            graph.progress, graph.current_step
        ));
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.inner.delete(id).await
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Graph>> {
        self.inner.list_for_user(user_id).await
    }
}

#[async_trait]
impl ResultRepository for FlakyStore {
    async fn insert(&self, result: &ProcessingResult) -> Result<bool> {
        let fail = self
            .result_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(Error::Internal("connection reset".into()));
        }
        ResultRepository::insert(&self.inner, result).await
    }

    async fn get_cell(&self, graph_id: Uuid, cell: GridCell) -> Result<Option<ProcessingResult>> {
        self.inner.get_cell(graph_id, cell).await
    }

    async fn best_for_graph(&self, graph_id: Uuid) -> Result<Option<ProcessingResult>> {
        self.inner.best_for_graph(graph_id).await
    }

    async fn list_for_graph(&self, graph_id: Uuid) -> Result<Vec<ProcessingResult>> {
        self.inner.list_for_graph(graph_id).await
    }

    async fn count_for_graph(&self, graph_id: Uuid) -> Result<i64> {
        self.inner.count_for_graph(graph_id).await
    }
}

#[async_trait]
impl TaskQueue for FlakyStore {
    async fn enqueue(&self, args: TaskArgs) -> Result<Uuid> {
        self.inner.enqueue(args).await
    }

    async fn claim_next_for_kinds(&self, kinds: &[TaskKind]) -> Result<Option<Task>> {
        self.inner.claim_next_for_kinds(kinds).await
    }

    async fn complete(&self, task_id: Uuid) -> Result<()> {
        self.inner.complete(task_id).await
    }

    async fn fail(&self, task_id: Uuid, error: &str) -> Result<()> {
        self.inner.fail(task_id, error).await
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>> {
        TaskQueue::get(&self.inner, task_id).await
    }

    async fn pending_count(&self) -> Result<i64> {
        self.inner.pending_count().await
    }
}

// =============================================================================
// Notifications
// =============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(ChannelKey, JobEvent)>>,
    failing: AtomicBool,
    timeline: Arc<Timeline>,
}

impl RecordingNotifier {
    pub fn new(timeline: Arc<Timeline>) -> Self {
        Self {
            timeline,
            ..Default::default()
        }
    }

    /// Refuse every publish (events are still recorded).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn kinds(&self) -> Vec<JobEventKind> {
        self.events.lock().unwrap().iter().map(|(_, e)| e.kind).collect()
    }

    pub fn events(&self) -> Vec<(ChannelKey, JobEvent)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingNotifier {
    async fn publish(&self, key: &ChannelKey, event: &JobEvent) -> Result<()> {
        self.events.lock().unwrap().push((key.clone(), *event));
        self.timeline.push(format!("event {}", event.kind.label()));
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Notification("socket closed".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Connectors and parser
// =============================================================================

pub fn links(n: usize) -> RawLinks {
    RawLinks::Links(
        (0..n)
            .map(|i| RawLink {
                source: format!("author{i}"),
                target: format!("author{}", i + 1),
                text: "graph clustering".into(),
            })
            .collect(),
    )
}

/// Connector returning fixed links or raising.
pub struct FakeConnector {
    method: String,
    links: Option<RawLinks>,
}

impl FakeConnector {
    pub fn returning(method: &str, links: RawLinks) -> Arc<Self> {
        Arc::new(Self {
            method: method.into(),
            links: Some(links),
        })
    }

    pub fn raising(method: &str) -> Arc<Self> {
        Arc::new(Self {
            method: method.into(),
            links: None,
        })
    }
}

#[async_trait]
impl SourceConnector for FakeConnector {
    fn method(&self) -> &str {
        &self.method
    }

    async fn fetch(&self, _params: &Map<String, JsonValue>) -> Result<RawLinks> {
        self.links
            .clone()
            .ok_or_else(|| Error::source(self.method.clone(), "upstream returned 503"))
    }
}

/// Parser returning a fixed graph or raising. Records the options it saw.
pub struct FakeParser {
    parsed: Option<ParsedGraph>,
    seen: Mutex<Vec<(ImportOptions, bool)>>,
}

impl FakeParser {
    pub fn with_labels(labels: &[&str]) -> Arc<Self> {
        let labels: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        let edges = (1..labels.len() as u32)
            .map(|i| linkage_jobs::Edge {
                source: i - 1,
                target: i,
                document: i - 1,
            })
            .collect::<Vec<_>>();
        Arc::new(Self {
            parsed: Some(ParsedGraph {
                matrix: TermDocumentMatrix {
                    terms: vec!["graph".into()],
                    documents: edges.len() as u32,
                    entries: (0..edges.len() as u32).map(|d| (d, 0, 1)).collect(),
                },
                labels,
                edges,
            }),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn raising() -> Arc<Self> {
        Arc::new(Self {
            parsed: None,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<(ImportOptions, bool)> {
        self.seen.lock().unwrap().clone()
    }
}

impl GraphParser for FakeParser {
    fn parse(&self, _links: &RawLinks, options: &ImportOptions, directed: bool) -> Result<ParsedGraph> {
        self.seen.lock().unwrap().push((*options, directed));
        self.parsed
            .clone()
            .ok_or_else(|| Error::Parse("malformed record on line 3".into()))
    }
}

// =============================================================================
// Engine
// =============================================================================

pub fn payload(cell: GridCell, crit: f64) -> ResultPayload {
    ResultPayload {
        n_clusters: cell.clusters,
        n_topics: cell.topics,
        clusters: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
        topics: vec![vec![0.5, 0.5]],
        crit,
        ..Default::default()
    }
}

/// Engine reporting every unit of the grid, then returning one payload per
/// cell (`crit` grows with the cell index).
#[derive(Default)]
pub struct FakeEngine {
    fail: bool,
    /// Report from this many OS threads at once when above one.
    threads: usize,
    delete_on_finish: Mutex<Option<(MemoryStore, Uuid)>>,
    requests: Mutex<Vec<EngineRequest>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    /// Report units from `threads` threads sharing one counter, so reports
    /// may reach the sink out of order.
    pub fn concurrent(threads: usize) -> Arc<Self> {
        Arc::new(Self {
            threads,
            ..Default::default()
        })
    }

    /// Delete `graph_id` from `store` after the last unit, before returning
    /// the results.
    pub fn delete_before_returning(&self, store: MemoryStore, graph_id: Uuid) {
        *self.delete_on_finish.lock().unwrap() = Some((store, graph_id));
    }

    pub fn requests(&self) -> Vec<EngineRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl GraphEngine for FakeEngine {
    async fn process(&self, request: EngineRequest, progress: ProgressSink) -> Result<EngineOutput> {
        self.requests.lock().unwrap().push(request.clone());
        let total = request.grid.total_units(request.n_repeat);
        let mut log = String::new();
        if self.threads > 1 {
            let counter = AtomicU64::new(0);
            std::thread::scope(|scope| {
                for _ in 0..self.threads {
                    scope.spawn(|| loop {
                        let done = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        if done > total {
                            break;
                        }
                        progress.report(format!("unit {done}\n"), done, format!("unit {done} of {total}"));
                    });
                }
            });
        } else {
            for done in 1..=total {
                if self.fail && done * 2 > total {
                    return Err(Error::Engine("segmentation fault".into()));
                }
                log.push_str(&format!("unit {done}\n"));
                progress.report(log.clone(), done, format!("unit {done} of {total}"));
                tokio::task::yield_now().await;
            }
        }
        let pending_delete = self.delete_on_finish.lock().unwrap().take();
        if let Some((store, graph_id)) = pending_delete {
            GraphRepository::delete(&store, graph_id).await?;
        }
        let results = request
            .grid
            .cells()
            .enumerate()
            .map(|(i, cell)| (cell, payload(cell, i as f64)))
            .collect();
        Ok(EngineOutput {
            results,
            log: format!("{log}finished"),
        })
    }
}

// =============================================================================
// Wiring
// =============================================================================

pub struct Harness {
    pub store: FlakyStore,
    pub notifier: Arc<RecordingNotifier>,
    pub parser: Arc<FakeParser>,
    pub engine: Arc<FakeEngine>,
    pub timeline: Arc<Timeline>,
    pub orchestrator: Arc<Orchestrator>,
}

pub struct HarnessBuilder {
    connectors: ConnectorRegistry,
    parser: Arc<FakeParser>,
    engine: Arc<FakeEngine>,
    config: OrchestratorConfig,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            connectors: ConnectorRegistry::new(),
            parser: FakeParser::with_labels(&["alice", "bob", "carol"]),
            engine: FakeEngine::new(),
            config: OrchestratorConfig::default(),
        }
    }
}

impl HarnessBuilder {
    pub fn connector(mut self, connector: Arc<dyn SourceConnector>) -> Self {
        self.connectors.register(connector);
        self
    }

    pub fn parser(mut self, parser: Arc<FakeParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn engine(mut self, engine: Arc<FakeEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn n_repeat(mut self, n_repeat: u32) -> Self {
        self.config = self
            .config
            .with_clustering(ClusteringConfig::default().with_n_repeat(n_repeat));
        self
    }

    /// No persister or notification delays.
    pub fn instant(mut self) -> Self {
        self.config = self
            .config
            .with_retry(RetryPolicy::default().with_delay(Duration::ZERO))
            .with_error_notify_delay(Duration::ZERO)
            .with_import_notify_delay(Duration::ZERO);
        self
    }

    pub fn build(self) -> Harness {
        let timeline = Arc::new(Timeline::default());
        let store = FlakyStore::new(timeline.clone());
        let notifier = Arc::new(RecordingNotifier::new(timeline.clone()));
        let orchestrator = Orchestrator::builder()
            .with_store(store.clone())
            .with_connectors(self.connectors)
            .with_parser(self.parser.clone())
            .with_engine(self.engine.clone())
            .with_notifier(notifier.clone())
            .with_config(self.config)
            .build()
            .unwrap();
        Harness {
            store,
            notifier,
            parser: self.parser,
            engine: self.engine,
            timeline,
            orchestrator: Arc::new(orchestrator),
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    pub async fn graph(&self, grid: linkage_jobs::GridParams) -> Graph {
        self.orchestrator
            .create_graph(Uuid::new_v4(), "citations", grid, false)
            .await
            .unwrap()
    }

    pub async fn reload(&self, graph_id: Uuid) -> Graph {
        GraphRepository::get(&self.store, graph_id).await.unwrap()
    }

    /// Import the default parsed graph so the job is ready to cluster.
    pub async fn imported(&self, grid: linkage_jobs::GridParams) -> Graph {
        let graph = self.graph(grid).await;
        self.orchestrator
            .import(graph.id, links(3), ImportOptions::default())
            .await
            .unwrap();
        self.reload(graph.id).await
    }
}
