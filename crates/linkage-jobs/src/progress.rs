//! Clustering progress: unit arithmetic and the single-writer mailbox.
//!
//! The engine reports through a [`ProgressSink`]; one mailbox task owns the
//! job record for the duration of the run and serializes every progress
//! persist and publish. The terminal value (all units done) only updates the
//! in-memory record: completion is persisted by the orchestrator after the
//! result rows.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use linkage_core::{
    ChannelKey, Error, Graph, GraphRepository, GridParams, JobEvent, JobStep,
    NotificationChannel, ProgressReport, Result,
};

use crate::persister::persist_once;

/// Progress derived from one engine callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub units_done: u64,
    pub units_total: u64,
    /// `units_done / units_total`.
    pub fraction: f64,
}

impl ProgressUpdate {
    pub fn step(&self) -> JobStep {
        JobStep::Clustering {
            units_done: self.units_done,
            units_total: self.units_total,
        }
    }
}

/// What to do with one engine callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// Persist and publish.
    Report(ProgressUpdate),
    /// Last unit done: update memory only.
    Terminal(ProgressUpdate),
    /// Duplicate or out-of-order callback.
    Stale,
}

/// Tracks completion of one clustering run.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    units_total: u64,
    last_done: u64,
}

impl ProgressTracker {
    /// Total = clusters span × topics span × `n_repeat`.
    pub fn new(grid: &GridParams, n_repeat: u32) -> Self {
        Self {
            units_total: grid.total_units(n_repeat.max(1)),
            last_done: 0,
        }
    }

    pub fn units_total(&self) -> u64 {
        self.units_total
    }

    pub fn units_done(&self) -> u64 {
        self.last_done
    }

    /// Classify a callback. Progress never regresses.
    pub fn observe(&mut self, units_done: u64) -> Observation {
        if units_done <= self.last_done {
            return Observation::Stale;
        }
        let units_done = units_done.min(self.units_total);
        self.last_done = units_done;
        let update = ProgressUpdate {
            units_done,
            units_total: self.units_total,
            fraction: units_done as f64 / self.units_total as f64,
        };
        if units_done == self.units_total {
            Observation::Terminal(update)
        } else {
            Observation::Report(update)
        }
    }
}

/// Owns the job record while the engine runs.
pub struct ProgressMailbox {
    tracker: ProgressTracker,
    graph: Graph,
    graphs: Arc<dyn GraphRepository>,
    notifier: Arc<dyn NotificationChannel>,
    channel: ChannelKey,
}

impl ProgressMailbox {
    pub fn new(
        tracker: ProgressTracker,
        graph: Graph,
        graphs: Arc<dyn GraphRepository>,
        notifier: Arc<dyn NotificationChannel>,
    ) -> Self {
        let channel = ChannelKey::for_user(graph.user_id);
        Self {
            tracker,
            graph,
            graphs,
            notifier,
            channel,
        }
    }

    /// Start consuming reports.
    pub fn spawn(self, rx: mpsc::UnboundedReceiver<ProgressReport>) -> MailboxHandle {
        let (close_tx, close_rx) = oneshot::channel();
        let join = tokio::spawn(self.run(rx, close_rx));
        MailboxHandle { close_tx, join }
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ProgressReport>,
        mut close_rx: oneshot::Receiver<()>,
    ) -> Graph {
        loop {
            tokio::select! {
                biased;
                report = rx.recv() => match report {
                    Some(report) => self.handle(report).await,
                    None => break,
                },
                _ = &mut close_rx => {
                    // Senders may outlive the run; drain what is buffered.
                    rx.close();
                    while let Some(report) = rx.recv().await {
                        self.handle(report).await;
                    }
                    break;
                }
            }
        }
        debug!(
            subsystem = "jobs",
            component = "progress",
            graph_id = %self.graph.id,
            units_done = self.tracker.units_done(),
            units_total = self.tracker.units_total(),
            "Progress mailbox drained"
        );
        self.graph
    }

    async fn handle(&mut self, report: ProgressReport) {
        let update = match self.tracker.observe(report.units_done) {
            Observation::Stale => {
                trace!(
                    graph_id = %self.graph.id,
                    units_done = report.units_done,
                    "Ignoring stale progress report"
                );
                return;
            }
            Observation::Terminal(update) => {
                self.apply(&report, &update);
                return;
            }
            Observation::Report(update) => update,
        };

        self.apply(&report, &update);
        trace!(
            subsystem = "jobs",
            component = "progress",
            graph_id = %self.graph.id,
            units_done = update.units_done,
            units_total = update.units_total,
            message = %report.message,
            "Clustering progress"
        );

        if persist_once("graph", self.graph.id, self.graphs.save(&self.graph)).await {
            let event = JobEvent::update(self.graph.id);
            if let Err(e) = self.notifier.publish(&self.channel, &event).await {
                warn!(
                    subsystem = "jobs",
                    component = "progress",
                    graph_id = %self.graph.id,
                    error = %e,
                    "Progress notification failed"
                );
            }
        }
    }

    fn apply(&mut self, report: &ProgressReport, update: &ProgressUpdate) {
        self.graph.log = report.log.clone();
        self.graph.current_step = update.step();
        self.graph.progress = update.fraction;
    }
}

/// Handle to a running mailbox.
pub struct MailboxHandle {
    close_tx: oneshot::Sender<()>,
    join: JoinHandle<Graph>,
}

impl MailboxHandle {
    /// Drain outstanding reports and return the job record with the latest
    /// in-memory progress.
    pub async fn finish(self) -> Result<Graph> {
        let _ = self.close_tx.send(());
        self.join
            .await
            .map_err(|e| Error::Internal(format!("progress mailbox task failed: {e}")))
    }
}
