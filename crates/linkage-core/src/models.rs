//! Data model: graphs (jobs), grid parameters, result rows, and tasks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{JobFailure, JobState, JobStep};
use crate::{defaults, Error, Result};

// =============================================================================
// Grid
// =============================================================================

/// One `(clusters, topics)` parameter pair evaluated by the graph engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GridCell {
    pub clusters: i32,
    pub topics: i32,
}

impl GridCell {
    pub fn new(clusters: i32, topics: i32) -> Self {
        Self { clusters, topics }
    }
}

impl std::fmt::Display for GridCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({} clusters, {} topics)", self.clusters, self.topics)
    }
}

/// Inclusive grid bounds of a job.
///
/// Invariant: all bounds are positive and `max >= min` on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridParams {
    clusters_min: i32,
    clusters_max: i32,
    topics_min: i32,
    topics_max: i32,
}

impl GridParams {
    /// Validate and build grid bounds.
    pub fn new(clusters_min: i32, clusters_max: i32, topics_min: i32, topics_max: i32) -> Result<Self> {
        if clusters_min <= 0 || topics_min <= 0 {
            return Err(Error::InvalidInput(format!(
                "grid bounds must be positive (clusters_min={clusters_min}, topics_min={topics_min})"
            )));
        }
        if clusters_max < clusters_min || topics_max < topics_min {
            return Err(Error::InvalidInput(format!(
                "grid max must be >= min (clusters {clusters_min}..{clusters_max}, topics {topics_min}..{topics_max})"
            )));
        }
        Ok(Self {
            clusters_min,
            clusters_max,
            topics_min,
            topics_max,
        })
    }

    /// A single-cell grid.
    pub fn single(clusters: i32, topics: i32) -> Result<Self> {
        Self::new(clusters, clusters, topics, topics)
    }

    pub fn clusters_min(&self) -> i32 {
        self.clusters_min
    }

    pub fn clusters_max(&self) -> i32 {
        self.clusters_max
    }

    pub fn topics_min(&self) -> i32 {
        self.topics_min
    }

    pub fn topics_max(&self) -> i32 {
        self.topics_max
    }

    /// Number of distinct grid cells.
    pub fn cell_count(&self) -> u64 {
        let clusters = (self.clusters_max - self.clusters_min + 1) as u64;
        let topics = (self.topics_max - self.topics_min + 1) as u64;
        clusters * topics
    }

    /// Total engine units of a run: every cell evaluated `n_repeat` times.
    pub fn total_units(&self, n_repeat: u32) -> u64 {
        self.cell_count() * u64::from(n_repeat)
    }

    /// Every cell of the grid, clusters-major.
    pub fn cells(&self) -> impl Iterator<Item = GridCell> + '_ {
        (self.clusters_min..=self.clusters_max).flat_map(move |clusters| {
            (self.topics_min..=self.topics_max).map(move |topics| GridCell { clusters, topics })
        })
    }

    pub fn contains(&self, cell: GridCell) -> bool {
        (self.clusters_min..=self.clusters_max).contains(&cell.clusters)
            && (self.topics_min..=self.topics_max).contains(&cell.topics)
    }
}

// =============================================================================
// Graph input
// =============================================================================

/// One raw link returned by a source connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLink {
    pub source: String,
    pub target: String,
    /// Text attached to the link (title, mail body, ...).
    pub text: String,
}

/// Raw edge payload carried from the retrieval stage to the import stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", content = "data", rename_all = "snake_case")]
pub enum RawLinks {
    /// Structured links from a connector.
    Links(Vec<RawLink>),
    /// CSV text of `source,target,text` records (file uploads).
    Csv(String),
}

impl RawLinks {
    /// Number of links in the payload (CSV counts non-blank records).
    pub fn len(&self) -> usize {
        match self {
            RawLinks::Links(links) => links.len(),
            RawLinks::Csv(text) => text.lines().filter(|l| !l.trim().is_empty()).count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A directed or undirected edge between two labels, carrying a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source: u32,
    pub target: u32,
    /// Row of the term-document matrix holding this edge's text.
    pub document: u32,
}

/// Sparse term-document matrix: one row per document (edge text).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TermDocumentMatrix {
    pub terms: Vec<String>,
    pub documents: u32,
    /// `(document, term, count)` triples.
    pub entries: Vec<(u32, u32, u32)>,
}

/// Structured graph fields produced by the parser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedGraph {
    pub labels: Vec<String>,
    pub edges: Vec<Edge>,
    pub matrix: TermDocumentMatrix,
}

impl ParsedGraph {
    /// Number of distinct non-blank labels.
    pub fn distinct_labels(&self) -> usize {
        let mut seen: Vec<&str> = self
            .labels
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect();
        seen.sort_unstable();
        seen.dedup();
        seen.len()
    }
}

// =============================================================================
// Graph (job)
// =============================================================================

/// One user-submitted analysis request and its mutable run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub directed: bool,
    pub labels: Vec<String>,
    pub edges: Vec<Edge>,
    pub matrix: TermDocumentMatrix,
    pub grid: GridParams,
    pub current_step: JobStep,
    /// Completion fraction in `[0, 1]`.
    pub progress: f64,
    /// Free text, replaced by the engine's log.
    pub log: String,
    /// `None` means no error.
    pub error: Option<JobFailure>,
    /// Wall-clock seconds of the last clustering run.
    pub time_taken: f64,
    /// Result rows lost to persistence exhaustion in the last run.
    pub lost_results: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Graph {
    /// Create an empty job for the given owner and grid.
    pub fn new(user_id: Uuid, name: impl Into<String>, grid: GridParams, directed: bool) -> Self {
        let now = Utc::now();
        Self {
            id: crate::new_v7(),
            user_id,
            name: name.into(),
            directed,
            labels: Vec::new(),
            edges: Vec::new(),
            matrix: TermDocumentMatrix::default(),
            grid,
            current_step: JobStep::Queued,
            progress: 0.0,
            log: String::new(),
            error: None,
            time_taken: 0.0,
            lost_results: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copy parsed fields into the job.
    pub fn apply_parsed(&mut self, parsed: ParsedGraph) {
        self.labels = parsed.labels;
        self.edges = parsed.edges;
        self.matrix = parsed.matrix;
    }

    /// Text stored in the `error_log` column (empty = no error).
    pub fn error_log(&self) -> String {
        self.error.map(|e| e.to_string()).unwrap_or_default()
    }

    /// Lifecycle state derived from the persisted fields.
    pub fn state(&self) -> JobState {
        if let Some(failure) = self.error {
            return JobState::Errored { failure };
        }
        match self.current_step {
            JobStep::Queued => JobState::Queued,
            JobStep::RetrievingData => JobState::Retrieving,
            JobStep::MakingGraph => JobState::Importing,
            JobStep::Clustering { .. } => JobState::Clustering,
            JobStep::Clustered if self.progress >= 1.0 => match self.lost_results {
                0 => JobState::Done,
                lost => JobState::DoneWithLosses { lost },
            },
            JobStep::Clustered => JobState::Clustering,
        }
    }

    /// Mark the job as errored with the given failure.
    pub fn fail(&mut self, failure: JobFailure) {
        self.error = Some(failure);
        self.progress = 1.0;
    }
}

// =============================================================================
// Results
// =============================================================================

/// Dense row-major matrix as produced by the engine.
pub type Matrix = Vec<Vec<f64>>;

/// Engine output for one grid cell. The cell and `crit` are required; an
/// omitted matrix is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub n_clusters: i32,
    pub n_topics: i32,
    #[serde(default)]
    pub clusters: Matrix,
    #[serde(default)]
    pub topics: Matrix,
    #[serde(default)]
    pub topics_per_edges: Matrix,
    #[serde(default)]
    pub rho: Matrix,
    #[serde(default)]
    pub pi: Matrix,
    #[serde(default)]
    pub theta: Matrix,
    /// Fitness criterion; higher is better.
    pub crit: f64,
}

impl ResultPayload {
    pub fn cell(&self) -> GridCell {
        GridCell::new(self.n_clusters, self.n_topics)
    }
}

/// Persisted outcome of one grid cell. Unique on `(graph_id, cell)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub id: Uuid,
    pub graph_id: Uuid,
    pub cell: GridCell,
    pub payload: ResultPayload,
    pub created_at: DateTime<Utc>,
}

impl ProcessingResult {
    pub fn from_payload(graph_id: Uuid, payload: ResultPayload) -> Self {
        Self {
            id: crate::new_v7(),
            graph_id,
            cell: payload.cell(),
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn crit(&self) -> f64 {
        self.payload.crit
    }
}

/// Everything the engine returns for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineOutput {
    pub results: BTreeMap<GridCell, ResultPayload>,
    pub log: String,
}

/// Arguments of one engine run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineRequest {
    pub edges: Vec<Edge>,
    pub matrix: TermDocumentMatrix,
    pub grid: GridParams,
    pub n_repeat: u32,
    pub max_inner_iterations: u32,
    pub max_outer_iterations: u32,
    pub directed: bool,
    pub seed: u64,
}

// =============================================================================
// Import parameters
// =============================================================================

/// Flags forwarded to the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOptions {
    pub ignore_self_loop: bool,
    pub filter_largest_subgraph: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            ignore_self_loop: true,
            filter_largest_subgraph: false,
        }
    }
}

/// Connector parameters with the control flags already popped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceParams {
    pub options: ImportOptions,
    /// Parameters forwarded verbatim to the connector.
    pub forwarded: serde_json::Map<String, serde_json::Value>,
}

impl SourceParams {
    /// Split control flags out of a raw parameter map.
    ///
    /// `ignore_self_loop` (default true) and `filter_largest_subgraph`
    /// (default false) are popped; `directed` is stripped, it is decided at
    /// job creation.
    pub fn from_map(mut params: serde_json::Map<String, serde_json::Value>) -> Self {
        let ignore_self_loop = params
            .remove("ignore_self_loop")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let filter_largest_subgraph = params
            .remove("filter_largest_subgraph")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        params.remove("directed");
        Self {
            options: ImportOptions {
                ignore_self_loop,
                filter_largest_subgraph,
            },
            forwarded: params,
        }
    }
}

// =============================================================================
// Tasks
// =============================================================================

/// Kind of queued unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Retrieve,
    Import,
    Cluster,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Retrieve => "retrieve",
            TaskKind::Import => "import",
            TaskKind::Cluster => "cluster",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "retrieve" => Some(TaskKind::Retrieve),
            "import" => Some(TaskKind::Import),
            "cluster" => Some(TaskKind::Cluster),
            _ => None,
        }
    }
}

/// Arguments of one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskArgs {
    Retrieve {
        graph_id: Uuid,
        method: String,
        params: SourceParams,
    },
    Import {
        graph_id: Uuid,
        links: RawLinks,
        options: ImportOptions,
    },
    Cluster {
        graph_id: Uuid,
        /// Engine seed; drawn at random when absent.
        seed: Option<u64>,
        /// Delay before the completion event, in milliseconds.
        notify_delay_ms: u64,
    },
}

impl TaskArgs {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskArgs::Retrieve { .. } => TaskKind::Retrieve,
            TaskArgs::Import { .. } => TaskKind::Import,
            TaskArgs::Cluster { .. } => TaskKind::Cluster,
        }
    }

    pub fn graph_id(&self) -> Uuid {
        match self {
            TaskArgs::Retrieve { graph_id, .. }
            | TaskArgs::Import { graph_id, .. }
            | TaskArgs::Cluster { graph_id, .. } => *graph_id,
        }
    }
}

/// Status of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }
}

/// A task as stored by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub args: TaskArgs,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A fresh pending task.
    pub fn new(args: TaskArgs) -> Self {
        Self {
            id: crate::new_v7(),
            args,
            status: TaskStatus::Pending,
            error_message: None,
            retry_count: 0,
            max_retries: defaults::TASK_MAX_RETRIES,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.args.kind()
    }
}
