//! Job orchestrator: drives one graph through retrieval, import and
//! clustering.
//!
//! ```text
//! Queued → Retrieving → Importing → Clustering → Done | DoneWithLosses
//!              ↘            ↘            ↘
//!                         Errored
//! ```
//!
//! Step transitions are written once and followed by a step-update event.
//! Result rows and terminal job writes go through the [`RetryingPersister`].
//! Faults in the connector, parser or engine are recorded on the job and then
//! returned to the caller so the task layer sees the failure; validation
//! outcomes (no results, empty graph) are recorded and returned as
//! [`StageOutcome::Errored`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::{Map, Value as JsonValue};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use linkage_core::{
    classify_source_method, defaults, ChannelKey, EngineRequest, Error, Graph, GraphEngine,
    GraphParser, GraphRepository, GridCell, GridParams, ImportOptions, JobEvent, JobFailure,
    JobState, JobStep, NotificationChannel, ProcessingResult, ProgressSink, RawLinks, Result,
    ResultRepository, SourceParams, TaskArgs, TaskQueue,
};

use crate::config::OrchestratorConfig;
use crate::connectors::ConnectorRegistry;
use crate::persister::{persist_once, PersistOutcome, RetryingPersister};
use crate::progress::{ProgressMailbox, ProgressTracker};

/// How a stage invocation ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageOutcome {
    /// Import finished and queued the clustering task.
    ClusteringQueued { task_id: Uuid },
    /// Clustering finished; `Done` or `DoneWithLosses`.
    Completed(JobState),
    /// The job was moved to `Errored` by a validation outcome.
    Errored(JobFailure),
    /// The job was not in a state this stage may start from (for example a
    /// redelivered task for an errored job). Nothing was changed.
    Skipped(JobState),
}

/// The job state machine and its collaborators.
pub struct Orchestrator {
    graphs: Arc<dyn GraphRepository>,
    results: Arc<dyn ResultRepository>,
    tasks: Arc<dyn TaskQueue>,
    connectors: Arc<ConnectorRegistry>,
    parser: Arc<dyn GraphParser>,
    engine: Arc<dyn GraphEngine>,
    notifier: Arc<dyn NotificationChannel>,
    config: OrchestratorConfig,
    persister: RetryingPersister,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Create an empty job.
    pub async fn create_graph(
        &self,
        user_id: Uuid,
        name: impl Into<String>,
        grid: GridParams,
        directed: bool,
    ) -> Result<Graph> {
        let graph = Graph::new(user_id, name, grid, directed);
        self.graphs.insert(&graph).await?;
        info!(
            subsystem = "jobs",
            component = "orchestrator",
            op = "create_graph",
            graph_id = %graph.id,
            %user_id,
            cells = grid.cell_count(),
            "Graph created"
        );
        Ok(graph)
    }

    /// Queue a retrieval from an external source. Control flags are split
    /// out of `params` here.
    pub async fn submit_retrieval(
        &self,
        graph_id: Uuid,
        method: impl Into<String>,
        params: Map<String, JsonValue>,
    ) -> Result<Uuid> {
        self.tasks
            .enqueue(TaskArgs::Retrieve {
                graph_id,
                method: method.into(),
                params: SourceParams::from_map(params),
            })
            .await
    }

    /// Queue an import of uploaded links.
    pub async fn submit_import(
        &self,
        graph_id: Uuid,
        links: RawLinks,
        options: ImportOptions,
    ) -> Result<Uuid> {
        self.tasks
            .enqueue(TaskArgs::Import {
                graph_id,
                links,
                options,
            })
            .await
    }

    /// Queue a clustering run of an imported graph. The completion event is
    /// sent without delay.
    pub async fn submit_clustering(&self, graph_id: Uuid, seed: Option<u64>) -> Result<Uuid> {
        self.tasks
            .enqueue(TaskArgs::Cluster {
                graph_id,
                seed,
                notify_delay_ms: 0,
            })
            .await
    }

    // =========================================================================
    // Stages
    // =========================================================================

    /// Retrieving stage: fetch links and import them inline.
    pub async fn retrieve(
        &self,
        graph_id: Uuid,
        method: &str,
        params: SourceParams,
    ) -> Result<StageOutcome> {
        let mut graph = self.graphs.get(graph_id).await?;
        if let Some(skipped) = self.check_entry(&graph, JobState::Retrieving, "retrieve") {
            return Ok(skipped);
        }

        self.enter_step(&mut graph, JobStep::RetrievingData).await;
        info!(
            subsystem = "jobs",
            component = "orchestrator",
            op = "retrieve",
            %graph_id,
            method,
            "Retrieving data"
        );

        let links = match self.connectors.fetch(method, &params.forwarded).await {
            Ok(links) => links,
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "orchestrator",
                    op = "retrieve",
                    %graph_id,
                    method,
                    error = %e,
                    "Source connector failed"
                );
                return self.abort(&mut graph, JobFailure::ImportFailed, Some(e)).await;
            }
        };

        if links.len() < defaults::MIN_LINKS {
            let failure = JobFailure::NoResults(classify_source_method(method));
            debug!(%graph_id, method, links = links.len(), "Too few links to import");
            return self.abort(&mut graph, failure, None).await;
        }

        self.import_graph(graph, links, params.options).await
    }

    /// Importing stage for uploaded links.
    pub async fn import(
        &self,
        graph_id: Uuid,
        links: RawLinks,
        options: ImportOptions,
    ) -> Result<StageOutcome> {
        let graph = self.graphs.get(graph_id).await?;
        if let Some(skipped) = self.check_entry(&graph, JobState::Importing, "import") {
            return Ok(skipped);
        }
        self.import_graph(graph, links, options).await
    }

    async fn import_graph(
        &self,
        mut graph: Graph,
        links: RawLinks,
        options: ImportOptions,
    ) -> Result<StageOutcome> {
        let graph_id = graph.id;
        self.enter_step(&mut graph, JobStep::MakingGraph).await;

        let parsed = match self.parser.parse(&links, &options, graph.directed) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "orchestrator",
                    op = "import",
                    %graph_id,
                    error = %e,
                    "Graph parsing failed"
                );
                return self.abort(&mut graph, JobFailure::ImportFailed, Some(e)).await;
            }
        };

        if parsed.distinct_labels() < defaults::MIN_LABELS {
            debug!(%graph_id, labels = parsed.distinct_labels(), "Not enough labels to cluster");
            return self.abort(&mut graph, JobFailure::EmptyGraph, None).await;
        }

        graph.apply_parsed(parsed);
        if let Err(e) = self.graphs.save(&graph).await {
            error!(
                subsystem = "jobs",
                component = "orchestrator",
                op = "import",
                %graph_id,
                error = %e,
                "Could not save imported graph"
            );
            return self.abort(&mut graph, JobFailure::ImportFailed, Some(e)).await;
        }

        let args = TaskArgs::Cluster {
            graph_id,
            seed: None,
            notify_delay_ms: self.config.import_notify_delay.as_millis() as u64,
        };
        let task_id = match self.tasks.enqueue(args).await {
            Ok(task_id) => task_id,
            Err(e) => {
                error!(%graph_id, error = %e, "Could not queue clustering");
                return self.abort(&mut graph, JobFailure::ImportFailed, Some(e)).await;
            }
        };

        info!(
            subsystem = "jobs",
            component = "orchestrator",
            op = "import",
            %graph_id,
            %task_id,
            labels = graph.labels.len(),
            edges = graph.edges.len(),
            "Graph imported, clustering queued"
        );
        Ok(StageOutcome::ClusteringQueued { task_id })
    }

    /// Clustering stage: run the full grid, persist one row per cell, then
    /// complete the job.
    pub async fn cluster(
        &self,
        graph_id: Uuid,
        seed: Option<u64>,
        notify_delay: Duration,
    ) -> Result<StageOutcome> {
        let mut graph = self.graphs.get(graph_id).await?;
        if let Some(skipped) = self.check_entry(&graph, JobState::Clustering, "cluster") {
            return Ok(skipped);
        }

        let start = Instant::now();
        let seed = seed.unwrap_or_else(|| rand::thread_rng().gen_range(0..defaults::ENGINE_SEED_RANGE));
        let clustering = self.config.clustering;
        let tracker = ProgressTracker::new(&graph.grid, clustering.n_repeat);

        graph.progress = 0.0;
        graph.lost_results = 0;
        self.enter_step(
            &mut graph,
            JobStep::Clustering {
                units_done: 0,
                units_total: tracker.units_total(),
            },
        )
        .await;
        info!(
            subsystem = "jobs",
            component = "orchestrator",
            op = "cluster",
            %graph_id,
            seed,
            units_total = tracker.units_total(),
            "Clustering started"
        );

        let request = EngineRequest {
            edges: graph.edges.clone(),
            matrix: graph.matrix.clone(),
            grid: graph.grid,
            n_repeat: clustering.n_repeat,
            max_inner_iterations: clustering.max_inner_iterations,
            max_outer_iterations: clustering.max_outer_iterations,
            directed: graph.directed,
            seed,
        };

        let (sink, rx) = ProgressSink::channel();
        let mailbox =
            ProgressMailbox::new(tracker, graph, self.graphs.clone(), self.notifier.clone())
                .spawn(rx);
        let output = self.engine.process(request, sink).await;
        let mut graph = mailbox.finish().await?;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "orchestrator",
                    op = "cluster",
                    %graph_id,
                    error = %e,
                    "Graph engine failed"
                );
                return self.abort(&mut graph, JobFailure::ClusteringFailed, Some(e)).await;
            }
        };

        let mut lost = 0u32;
        for payload in output.results.into_values() {
            let row = ProcessingResult::from_payload(graph_id, payload);
            match self
                .persister
                .persist("result", graph_id, || self.results.insert(&row))
                .await
            {
                PersistOutcome::Saved { .. } => {}
                PersistOutcome::Exhausted { .. } => lost += 1,
                PersistOutcome::GraphGone { .. } => return Err(self.deleted_mid_run(graph_id)),
            }
        }

        graph.progress = 1.0;
        graph.current_step = JobStep::Clustered;
        graph.log = output.log;
        graph.time_taken = start.elapsed().as_secs_f64();
        graph.lost_results = lost;
        let saved = self
            .persister
            .persist("graph", graph_id, || self.graphs.save(&graph))
            .await;
        if let PersistOutcome::GraphGone { .. } = saved {
            return Err(self.deleted_mid_run(graph_id));
        }

        if !notify_delay.is_zero() {
            sleep(notify_delay).await;
        }
        self.publish(&graph, JobEvent::done(graph_id)).await;

        let state = graph.state();
        if lost > 0 {
            error!(
                subsystem = "jobs",
                component = "orchestrator",
                op = "cluster",
                %graph_id,
                lost,
                "Clustering finished with lost results"
            );
        }
        info!(
            subsystem = "jobs",
            component = "orchestrator",
            op = "cluster",
            %graph_id,
            %state,
            saved = saved.is_saved(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Clustering finished"
        );
        Ok(StageOutcome::Completed(state))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Lifecycle state of a job.
    pub async fn job_state(&self, graph_id: Uuid) -> Result<JobState> {
        Ok(self.graphs.get(graph_id).await?.state())
    }

    /// Result of `cell`, or the highest-`crit` result when `cell` is `None`
    /// or has no stored result.
    pub async fn best_result(
        &self,
        graph_id: Uuid,
        cell: Option<GridCell>,
    ) -> Result<Option<ProcessingResult>> {
        if let Some(cell) = cell {
            if let Some(result) = self.results.get_cell(graph_id, cell).await? {
                return Ok(Some(result));
            }
        }
        self.results.best_for_graph(graph_id).await
    }

    /// Remove a job and its results. Workers running it are not signalled.
    pub async fn delete_graph(&self, graph_id: Uuid) -> Result<bool> {
        let deleted = self.graphs.delete(graph_id).await?;
        info!(
            subsystem = "jobs",
            component = "orchestrator",
            op = "delete_graph",
            %graph_id,
            deleted,
            "Graph delete requested"
        );
        Ok(deleted)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn check_entry(&self, graph: &Graph, next: JobState, op: &'static str) -> Option<StageOutcome> {
        let current = graph.state();
        if current.can_transition_to(&next) {
            return None;
        }
        warn!(
            subsystem = "jobs",
            component = "orchestrator",
            op,
            graph_id = %graph.id,
            %current,
            %next,
            "Stage not allowed from current state, skipping"
        );
        Some(StageOutcome::Skipped(current))
    }

    /// Single-attempt step write followed by a step-update event.
    async fn enter_step(&self, graph: &mut Graph, step: JobStep) {
        graph.current_step = step;
        persist_once("graph", graph.id, self.graphs.save(graph)).await;
        self.publish(graph, JobEvent::step_update(graph.id)).await;
    }

    /// Record `failure` on the job and end the stage. Faults the failure
    /// kind re-raises are returned as `Err`; validation outcomes end as
    /// [`StageOutcome::Errored`].
    async fn abort(
        &self,
        graph: &mut Graph,
        failure: JobFailure,
        fault: Option<Error>,
    ) -> Result<StageOutcome> {
        self.fail_job(graph, failure).await;
        match fault {
            Some(e) if failure.is_reraised() => Err(e),
            Some(e) => {
                debug!(graph_id = %graph.id, %failure, error = %e, "Fault recorded, not re-raised");
                Ok(StageOutcome::Errored(failure))
            }
            None => Ok(StageOutcome::Errored(failure)),
        }
    }

    fn deleted_mid_run(&self, graph_id: Uuid) -> Error {
        warn!(
            subsystem = "jobs",
            component = "orchestrator",
            op = "cluster",
            %graph_id,
            "Graph deleted during clustering, remaining writes dropped"
        );
        Error::GraphNotFound(graph_id)
    }

    /// Record a failure: errored state persisted with retry, then the error
    /// event after the configured delay.
    async fn fail_job(&self, graph: &mut Graph, failure: JobFailure) {
        graph.fail(failure);
        let graph: &Graph = graph;
        self.persister
            .persist("graph", graph.id, || self.graphs.save(graph))
            .await;
        info!(
            subsystem = "jobs",
            component = "orchestrator",
            op = "fail_job",
            graph_id = %graph.id,
            %failure,
            "Job errored"
        );
        let delay = self.config.error_notify_delay;
        if !delay.is_zero() {
            sleep(delay).await;
        }
        self.publish(graph, JobEvent::error(graph.id)).await;
    }

    async fn publish(&self, graph: &Graph, event: JobEvent) {
        let channel = ChannelKey::for_user(graph.user_id);
        if let Err(e) = self.notifier.publish(&channel, &event).await {
            warn!(
                subsystem = "jobs",
                component = "orchestrator",
                graph_id = %graph.id,
                event = %event.text(),
                error = %e,
                "Notification failed"
            );
        }
    }
}

/// Builder for [`Orchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    graphs: Option<Arc<dyn GraphRepository>>,
    results: Option<Arc<dyn ResultRepository>>,
    tasks: Option<Arc<dyn TaskQueue>>,
    connectors: ConnectorRegistry,
    parser: Option<Arc<dyn GraphParser>>,
    engine: Option<Arc<dyn GraphEngine>>,
    notifier: Option<Arc<dyn NotificationChannel>>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    /// Use one store for graphs, results and tasks.
    pub fn with_store<S>(self, store: S) -> Self
    where
        S: GraphRepository + ResultRepository + TaskQueue + Clone + 'static,
    {
        self.with_graphs(Arc::new(store.clone()))
            .with_results(Arc::new(store.clone()))
            .with_tasks(Arc::new(store))
    }

    pub fn with_graphs(mut self, graphs: Arc<dyn GraphRepository>) -> Self {
        self.graphs = Some(graphs);
        self
    }

    pub fn with_results(mut self, results: Arc<dyn ResultRepository>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_tasks(mut self, tasks: Arc<dyn TaskQueue>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn with_connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn GraphParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn GraphEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationChannel>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the orchestrator. Every collaborator except the connector
    /// registry is required.
    pub fn build(self) -> Result<Orchestrator> {
        fn required<T>(value: Option<T>, what: &str) -> Result<T> {
            value.ok_or_else(|| Error::Config(format!("orchestrator requires a {what}")))
        }

        Ok(Orchestrator {
            graphs: required(self.graphs, "graph repository")?,
            results: required(self.results, "result repository")?,
            tasks: required(self.tasks, "task queue")?,
            connectors: Arc::new(self.connectors),
            parser: required(self.parser, "graph parser")?,
            engine: required(self.engine, "graph engine")?,
            notifier: required(self.notifier, "notification channel")?,
            persister: RetryingPersister::new(self.config.retry),
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkage_core::EventBus;
    use linkage_db::MemoryStore;

    use crate::csv_parser::CsvLinkParser;
    use crate::engine::{CommandEngine, CommandEngineConfig};

    #[test]
    fn test_builder_requires_collaborators() {
        let err = Orchestrator::builder()
            .with_store(MemoryStore::new())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(msg) if msg.contains("graph parser")));
    }

    #[test]
    fn test_builder_with_everything() {
        let orchestrator = Orchestrator::builder()
            .with_store(MemoryStore::new())
            .with_parser(Arc::new(CsvLinkParser::new().unwrap()))
            .with_engine(Arc::new(CommandEngine::new(CommandEngineConfig::new("true"))))
            .with_notifier(Arc::new(EventBus::default()))
            .build()
            .unwrap();
        assert_eq!(orchestrator.config().retry.max_attempts, 20);
    }
}
