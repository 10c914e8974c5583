//! End-to-end orchestrator scenarios over the in-memory store and fakes.

mod common;

use std::time::Duration;

use serde_json::{json, Map};
use tokio::time::Instant;

use common::{links, FakeConnector, FakeEngine, FakeParser, Harness};
use linkage_jobs::{
    ChannelKey, Error, GridCell, GridParams, ImportOptions, JobEventKind, JobFailure, JobState,
    JobStep, RawLinks, ResultRepository, SourceKind, SourceParams, StageOutcome, TaskArgs,
};

fn grid(cmin: i32, cmax: i32, tmin: i32, tmax: i32) -> GridParams {
    GridParams::new(cmin, cmax, tmin, tmax).unwrap()
}

// =============================================================================
// Clustering
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_single_cell_grid_completes() {
    let h = Harness::builder().build();
    let graph = h.imported(grid(2, 2, 3, 3)).await;

    let outcome = h
        .orchestrator
        .cluster(graph.id, Some(7), Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(outcome, StageOutcome::Completed(JobState::Done));
    assert_eq!(h.store.count_for_graph(graph.id).await.unwrap(), 1);
    let stored = h.reload(graph.id).await;
    assert_eq!(stored.progress, 1.0);
    assert_eq!(stored.current_step.to_string(), "Clustering");
    assert_eq!(stored.error_log(), "");
    assert!(stored.log.ends_with("finished"));
    assert_eq!(h.engine.requests()[0].seed, 7);
}

#[tokio::test(start_paused = true)]
async fn test_half_progress_after_six_of_twelve_units() {
    let h = Harness::builder().n_repeat(2).build();
    let graph = h.imported(grid(2, 4, 5, 6)).await;

    h.orchestrator
        .cluster(graph.id, None, Duration::ZERO)
        .await
        .unwrap();

    let half = h
        .store
        .saves()
        .into_iter()
        .find(|g| g.id == graph.id && g.current_step.to_string() == "Clustering (6/12 models)")
        .expect("progress at 6/12 was persisted");
    assert_eq!(half.progress, 0.5);
    assert_eq!(h.store.count_for_graph(graph.id).await.unwrap(), 6);
    assert_eq!(h.engine.requests()[0].n_repeat, 2);
}

#[tokio::test(start_paused = true)]
async fn test_progress_reaches_one_only_in_terminal_persist() {
    let h = Harness::builder().n_repeat(2).build();
    let graph = h.imported(grid(2, 4, 5, 6)).await;

    h.orchestrator
        .cluster(graph.id, None, Duration::ZERO)
        .await
        .unwrap();

    let saves: Vec<_> = h.store.saves().into_iter().filter(|g| g.id == graph.id).collect();
    let (last, earlier) = saves.split_last().unwrap();
    assert_eq!(last.progress, 1.0);
    assert_eq!(last.current_step, JobStep::Clustered);

    let clustering: Vec<f64> = earlier
        .iter()
        .filter(|g| matches!(g.current_step, JobStep::Clustering { .. }))
        .map(|g| g.progress)
        .collect();
    // Entry write plus units 1..=11; unit 12 is never persisted on its own.
    assert_eq!(clustering.len(), 12);
    assert!(clustering.iter().all(|p| *p < 1.0));
    assert!(clustering.windows(2).all(|w| w[0] < w[1]));

    let updates = h
        .notifier
        .kinds()
        .into_iter()
        .filter(|k| *k == JobEventKind::Update)
        .count();
    assert_eq!(updates, 11);
}

#[tokio::test(start_paused = true)]
async fn test_done_event_follows_terminal_persist() {
    let h = Harness::builder().build();
    let graph = h.imported(grid(2, 3, 3, 3)).await;

    let start = Instant::now();
    h.orchestrator
        .cluster(graph.id, None, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(start.elapsed() >= Duration::from_secs(2));

    let timeline = h.timeline.entries();
    let done = timeline.iter().position(|e| e == "event DONE").unwrap();
    let terminal = timeline
        .iter()
        .position(|e| e == "save progress=1 step=Clustering")
        .unwrap();
    assert!(terminal < done);
    assert_eq!(done, timeline.len() - 1);

    let (channel, event) = h.notifier.events().pop().unwrap();
    assert_eq!(channel, ChannelKey::for_user(graph.user_id));
    assert_eq!(event.text(), format!("{} - DONE", graph.id));
}

#[tokio::test(start_paused = true)]
async fn test_result_saved_on_twentieth_attempt() {
    let h = Harness::builder().build();
    let graph = h.imported(grid(2, 2, 3, 3)).await;
    h.store.fail_next_result_inserts(19);

    let start = Instant::now();
    let outcome = h
        .orchestrator
        .cluster(graph.id, None, Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(outcome, StageOutcome::Completed(JobState::Done));
    assert_eq!(h.store.count_for_graph(graph.id).await.unwrap(), 1);
    assert_eq!(start.elapsed(), Duration::from_secs(19));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_result_write_marks_losses() {
    let h = Harness::builder().build();
    let graph = h.imported(grid(2, 3, 3, 3)).await;
    h.store.fail_next_result_inserts(20);

    let outcome = h
        .orchestrator
        .cluster(graph.id, None, Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        StageOutcome::Completed(JobState::DoneWithLosses { lost: 1 })
    );
    assert_eq!(h.store.count_for_graph(graph.id).await.unwrap(), 1);
    let stored = h.reload(graph.id).await;
    assert_eq!(stored.lost_results, 1);
    assert_eq!(stored.progress, 1.0);
    assert_eq!(h.notifier.kinds().last(), Some(&JobEventKind::Done));
}

#[tokio::test(start_paused = true)]
async fn test_rerun_keeps_one_row_per_cell() {
    let h = Harness::builder().build();
    let graph = h.imported(grid(2, 3, 3, 4)).await;

    for seed in [1, 2] {
        let outcome = h
            .orchestrator
            .cluster(graph.id, Some(seed), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Completed(JobState::Done));
    }

    assert_eq!(h.store.count_for_graph(graph.id).await.unwrap(), 4);
    assert_eq!(h.engine.requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_engine_failure_errors_job() {
    let h = Harness::builder().engine(FakeEngine::failing()).build();
    let graph = h.imported(grid(2, 3, 3, 4)).await;

    let err = h
        .orchestrator
        .cluster(graph.id, None, Duration::ZERO)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Engine(_)));
    let stored = h.reload(graph.id).await;
    assert_eq!(stored.error_log(), "Error while clustering");
    assert_eq!(stored.progress, 1.0);
    assert_eq!(h.store.count_for_graph(graph.id).await.unwrap(), 0);
    assert_eq!(h.notifier.kinds().last(), Some(&JobEventKind::Error));
}

#[tokio::test(start_paused = true)]
async fn test_publish_failures_do_not_fail_the_job() {
    let h = Harness::builder().build();
    let graph = h.imported(grid(2, 3, 3, 3)).await;
    h.notifier.set_failing(true);

    let outcome = h
        .orchestrator
        .cluster(graph.id, None, Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(outcome, StageOutcome::Completed(JobState::Done));
}

// =============================================================================
// Import
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_import_queues_clustering_with_delay() {
    let h = Harness::builder().build();
    let graph = h.graph(grid(2, 2, 3, 3)).await;

    let outcome = h
        .orchestrator
        .import(graph.id, links(3), ImportOptions::default())
        .await
        .unwrap();

    let StageOutcome::ClusteringQueued { task_id } = outcome else {
        panic!("expected clustering to be queued, got {outcome:?}");
    };
    let task = h.store.tasks().await.into_iter().find(|t| t.id == task_id).unwrap();
    assert_eq!(
        task.args,
        TaskArgs::Cluster {
            graph_id: graph.id,
            seed: None,
            notify_delay_ms: 2_000,
        }
    );

    let stored = h.reload(graph.id).await;
    assert_eq!(stored.labels, vec!["alice", "bob", "carol"]);
    assert_eq!(stored.current_step.to_string(), "Making the graph");
    assert_eq!(stored.state(), JobState::Importing);
    assert_eq!(h.notifier.kinds(), vec![JobEventKind::StepUpdate]);
}

#[tokio::test(start_paused = true)]
async fn test_single_label_graph_errors_without_results() {
    let h = Harness::builder().parser(FakeParser::with_labels(&["a"])).build();
    let graph = h.graph(grid(2, 2, 3, 3)).await;

    let outcome = h
        .orchestrator
        .import(graph.id, links(3), ImportOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, StageOutcome::Errored(JobFailure::EmptyGraph));
    let stored = h.reload(graph.id).await;
    assert_eq!(stored.error_log(), "No data to process for this graph");
    assert_eq!(stored.progress, 1.0);
    assert_eq!(h.store.count_for_graph(graph.id).await.unwrap(), 0);
    assert!(h.store.tasks().await.is_empty());
    assert_eq!(
        h.notifier.kinds(),
        vec![JobEventKind::StepUpdate, JobEventKind::Error]
    );
}

#[tokio::test(start_paused = true)]
async fn test_parser_failure_is_reraised() {
    let h = Harness::builder().parser(FakeParser::raising()).build();
    let graph = h.graph(grid(2, 2, 3, 3)).await;

    let err = h
        .orchestrator
        .import(graph.id, RawLinks::Csv("a,b,\"oops\n".into()), ImportOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Parse(_)));
    assert_eq!(h.reload(graph.id).await.error_log(), "Error while importing");
}

#[tokio::test(start_paused = true)]
async fn test_errored_job_is_absorbing() {
    let h = Harness::builder().parser(FakeParser::with_labels(&["a"])).build();
    let graph = h.graph(grid(2, 2, 3, 3)).await;
    h.orchestrator
        .import(graph.id, links(3), ImportOptions::default())
        .await
        .unwrap();

    let outcome = h
        .orchestrator
        .cluster(graph.id, None, Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        StageOutcome::Skipped(JobState::Errored {
            failure: JobFailure::EmptyGraph
        })
    );
    assert!(h.engine.requests().is_empty());
}

// =============================================================================
// Retrieval
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_raising_connector_reports_import_error() {
    let h = Harness::builder()
        .connector(FakeConnector::raising("hal_search"))
        .build();
    let graph = h.graph(grid(2, 2, 3, 3)).await;

    let start = Instant::now();
    let err = h
        .orchestrator
        .retrieve(graph.id, "hal_search", SourceParams::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Source { ref method, .. } if method == "hal_search"));
    let stored = h.reload(graph.id).await;
    assert_eq!(stored.error_log(), "Error while importing");
    assert_eq!(stored.progress, 1.0);
    assert_eq!(
        h.notifier.kinds(),
        vec![JobEventKind::StepUpdate, JobEventKind::Error]
    );
    // The error event waits for the step update to land first.
    assert!(start.elapsed() >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_empty_source_reports_source_specific_message() {
    let h = Harness::builder()
        .connector(FakeConnector::returning("pubmed_citations", links(0)))
        .build();
    let graph = h.graph(grid(2, 2, 3, 3)).await;

    let outcome = h
        .orchestrator
        .retrieve(graph.id, "pubmed_citations", SourceParams::default())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        StageOutcome::Errored(JobFailure::NoResults(SourceKind::Pubmed))
    );
    assert_eq!(
        h.reload(graph.id).await.error_log(),
        "No PubMed results for this request"
    );
}

#[tokio::test(start_paused = true)]
async fn test_single_link_is_not_enough() {
    let h = Harness::builder()
        .connector(FakeConnector::returning("mbox_to_csv", links(1)))
        .build();
    let graph = h.graph(grid(2, 2, 3, 3)).await;

    let outcome = h
        .orchestrator
        .retrieve(graph.id, "mbox_to_csv", SourceParams::default())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        StageOutcome::Errored(JobFailure::NoResults(SourceKind::Generic))
    );
    assert_eq!(
        h.reload(graph.id).await.error_log(),
        "No results for this request"
    );
}

#[tokio::test(start_paused = true)]
async fn test_unknown_method_reports_import_error() {
    let h = Harness::builder().build();
    let graph = h.graph(grid(2, 2, 3, 3)).await;

    let err = h
        .orchestrator
        .retrieve(graph.id, "arxiv_search", SourceParams::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Source { .. }));
    assert_eq!(h.reload(graph.id).await.error_log(), "Error while importing");
}

#[tokio::test(start_paused = true)]
async fn test_retrieval_imports_inline_with_forwarded_flags() {
    let h = Harness::builder()
        .connector(FakeConnector::returning("hal_search", links(4)))
        .build();
    let graph = h.graph(grid(2, 2, 3, 3)).await;

    let mut params = Map::new();
    params.insert("q".into(), json!("topic models"));
    params.insert("ignore_self_loop".into(), json!(false));
    params.insert("filter_largest_subgraph".into(), json!(true));
    params.insert("directed".into(), json!(true));

    let outcome = h
        .orchestrator
        .retrieve(graph.id, "hal_search", SourceParams::from_map(params))
        .await
        .unwrap();

    assert!(matches!(outcome, StageOutcome::ClusteringQueued { .. }));
    let (options, directed) = h.parser.seen()[0];
    assert!(!options.ignore_self_loop);
    assert!(options.filter_largest_subgraph);
    // Directedness comes from the job, not the request.
    assert!(!directed);

    let steps: Vec<String> = h
        .store
        .saves()
        .iter()
        .map(|g| g.current_step.to_string())
        .collect();
    assert_eq!(steps, vec!["Retrieving data", "Making the graph", "Making the graph"]);
}

// =============================================================================
// Queries
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_best_result_and_cell_fallback() {
    let h = Harness::builder().build();
    let graph = h.imported(grid(2, 3, 3, 4)).await;
    h.orchestrator
        .cluster(graph.id, None, Duration::ZERO)
        .await
        .unwrap();

    // The fake engine's crit grows with the cell index; (3, 4) is last.
    let best = h.orchestrator.best_result(graph.id, None).await.unwrap().unwrap();
    assert_eq!(best.cell, GridCell::new(3, 4));

    let cell = h
        .orchestrator
        .best_result(graph.id, Some(GridCell::new(2, 3)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cell.cell, GridCell::new(2, 3));

    let fallback = h
        .orchestrator
        .best_result(graph.id, Some(GridCell::new(9, 9)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fallback.cell, GridCell::new(3, 4));
}

#[tokio::test(start_paused = true)]
async fn test_delete_removes_graph_and_results() {
    let h = Harness::builder().build();
    let graph = h.imported(grid(2, 2, 3, 3)).await;
    h.orchestrator
        .cluster(graph.id, None, Duration::ZERO)
        .await
        .unwrap();

    assert!(h.orchestrator.delete_graph(graph.id).await.unwrap());
    assert!(!h.orchestrator.delete_graph(graph.id).await.unwrap());
    assert_eq!(h.store.count_for_graph(graph.id).await.unwrap(), 0);
    assert!(matches!(
        h.orchestrator.job_state(graph.id).await,
        Err(Error::GraphNotFound(id)) if id == graph.id
    ));
}

// =============================================================================
// Write failures and concurrency
// =============================================================================

fn clustering_units(h: &Harness, graph_id: uuid::Uuid) -> Vec<u64> {
    h.store
        .saves()
        .into_iter()
        .filter(|g| g.id == graph_id)
        .filter_map(|g| match g.current_step {
            JobStep::Clustering { units_done, .. } => Some(units_done),
            _ => None,
        })
        .collect()
}

fn update_count(h: &Harness) -> usize {
    h.notifier
        .kinds()
        .into_iter()
        .filter(|k| *k == JobEventKind::Update)
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_terminal_write_exhaustion_still_publishes_done() {
    let h = Harness::builder().build();
    let graph = h.imported(grid(2, 2, 3, 3)).await;
    h.store
        .fail_graph_saves(20, |g| g.current_step == JobStep::Clustered);

    let start = Instant::now();
    let outcome = h
        .orchestrator
        .cluster(graph.id, None, Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(outcome, StageOutcome::Completed(JobState::Done));
    assert_eq!(start.elapsed(), Duration::from_secs(19));

    let timeline = h.timeline.entries();
    let failed: Vec<usize> = timeline
        .iter()
        .enumerate()
        .filter(|(_, e)| e.starts_with("save failed progress=1 "))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(failed.len(), 20);
    let done = timeline.iter().position(|e| e == "event DONE").unwrap();
    assert!(failed.iter().all(|i| *i < done));
    assert_eq!(done, timeline.len() - 1);

    // The dropped write leaves the last stored progress in place.
    assert!(h.reload(graph.id).await.progress < 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_progress_write_skips_its_update() {
    let h = Harness::builder().n_repeat(2).build();
    let graph = h.imported(grid(2, 4, 5, 6)).await;
    h.store.fail_graph_saves(1, |g| {
        g.current_step
            == JobStep::Clustering {
                units_done: 6,
                units_total: 12,
            }
    });

    let outcome = h
        .orchestrator
        .cluster(graph.id, None, Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(outcome, StageOutcome::Completed(JobState::Done));
    let units = clustering_units(&h, graph.id);
    assert_eq!(units, vec![0, 1, 2, 3, 4, 5, 7, 8, 9, 10, 11]);
    assert_eq!(update_count(&h), 10);
    assert_eq!(h.reload(graph.id).await.progress, 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_reports_from_many_threads_never_regress() {
    let h = Harness::builder()
        .engine(FakeEngine::concurrent(4))
        .n_repeat(5)
        .build();
    let graph = h.imported(grid(2, 4, 5, 6)).await;

    let outcome = h
        .orchestrator
        .cluster(graph.id, None, Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(outcome, StageOutcome::Completed(JobState::Done));
    let units = clustering_units(&h, graph.id);
    assert_eq!(units[0], 0);
    assert!(units.windows(2).all(|w| w[0] < w[1]));
    assert!(units.iter().all(|u| *u < 30));
    // One UPDATE per persisted report; the entry write sends STEP UPDATE.
    assert_eq!(update_count(&h), units.len() - 1);

    let stored = h.reload(graph.id).await;
    assert_eq!(stored.progress, 1.0);
    assert_eq!(stored.current_step, JobStep::Clustered);
    assert_eq!(h.store.count_for_graph(graph.id).await.unwrap(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_graph_deleted_during_clustering_stops_without_retrying() {
    let h = Harness::builder().build();
    let graph = h.imported(grid(2, 3, 3, 3)).await;
    h.engine
        .delete_before_returning(h.store.inner.clone(), graph.id);

    let start = Instant::now();
    let err = h
        .orchestrator
        .cluster(graph.id, None, Duration::ZERO)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::GraphNotFound(id) if id == graph.id));
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert!(!h.notifier.kinds().contains(&JobEventKind::Done));
}
