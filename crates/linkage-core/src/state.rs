//! Typed job state: steps, failures, and the lifecycle state machine.
//!
//! The persisted Job carries `current_step` and `error_log` as text because
//! that is what the UI reads. Internally both are tagged variants and are only
//! rendered with [`std::fmt::Display`] at the storage/notification boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// =============================================================================
// JobStep
// =============================================================================

/// Human-visible step of a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum JobStep {
    /// Created, nothing has run yet. Renders as the empty string.
    #[default]
    Queued,
    /// Fetching links from an external source.
    RetrievingData,
    /// Parsing raw links into labels, edges and a term-document matrix.
    MakingGraph,
    /// Grid search in flight.
    Clustering { units_done: u64, units_total: u64 },
    /// Grid search finished (terminal step label).
    Clustered,
}

impl fmt::Display for JobStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStep::Queued => Ok(()),
            JobStep::RetrievingData => f.write_str("Retrieving data"),
            JobStep::MakingGraph => f.write_str("Making the graph"),
            JobStep::Clustering {
                units_done,
                units_total,
            } => write!(f, "Clustering ({}/{} models)", units_done, units_total),
            JobStep::Clustered => f.write_str("Clustering"),
        }
    }
}

impl FromStr for JobStep {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(JobStep::Queued),
            "Retrieving data" => Ok(JobStep::RetrievingData),
            "Making the graph" => Ok(JobStep::MakingGraph),
            "Clustering" => Ok(JobStep::Clustered),
            other => {
                let counts = other
                    .strip_prefix("Clustering (")
                    .and_then(|rest| rest.strip_suffix(" models)"))
                    .and_then(|rest| rest.split_once('/'))
                    .and_then(|(done, total)| Some((done.parse().ok()?, total.parse().ok()?)));
                match counts {
                    Some((units_done, units_total)) => Ok(JobStep::Clustering {
                        units_done,
                        units_total,
                    }),
                    None => Err(crate::Error::InvalidInput(format!(
                        "unknown job step: {other:?}"
                    ))),
                }
            }
        }
    }
}

// =============================================================================
// Source classification
// =============================================================================

/// External source family, derived from the connector method name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Hal,
    Arxiv,
    Pubmed,
    Twitter,
    Generic,
}

/// Method-name substrings mapped to their source family.
///
/// Matching is case-sensitive; the first matching row wins, so the most
/// specific rows come first.
pub const SOURCE_PREFIXES: &[(&str, SourceKind)] = &[
    ("hal_", SourceKind::Hal),
    ("arxiv_", SourceKind::Arxiv),
    ("pubmed_", SourceKind::Pubmed),
    ("twitter_", SourceKind::Twitter),
    ("loklak_", SourceKind::Twitter),
];

/// Classify a connector method name into its source family.
pub fn classify_source_method(method: &str) -> SourceKind {
    SOURCE_PREFIXES
        .iter()
        .find(|(prefix, _)| method.contains(prefix))
        .map(|(_, kind)| *kind)
        .unwrap_or(SourceKind::Generic)
}

// =============================================================================
// JobFailure
// =============================================================================

/// User-visible reason a job ended in the `Errored` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "source", rename_all = "snake_case")]
pub enum JobFailure {
    /// The source returned fewer than two links.
    NoResults(SourceKind),
    /// The connector or the parser raised.
    ImportFailed,
    /// Parsing succeeded but produced fewer than two distinct labels.
    EmptyGraph,
    /// The graph engine failed part-way through the grid.
    ClusteringFailed,
}

impl JobFailure {
    /// Whether the underlying fault is re-raised to the task layer after the
    /// failure has been recorded. Validation outcomes are not.
    pub fn is_reraised(&self) -> bool {
        matches!(self, JobFailure::ImportFailed | JobFailure::ClusteringFailed)
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::NoResults(SourceKind::Hal) => f.write_str("No HAL results for this request"),
            JobFailure::NoResults(SourceKind::Arxiv) => {
                f.write_str("No arXiv results for this request")
            }
            JobFailure::NoResults(SourceKind::Pubmed) => {
                f.write_str("No PubMed results for this request")
            }
            JobFailure::NoResults(SourceKind::Twitter) => {
                f.write_str("No Twitter results for this request")
            }
            JobFailure::NoResults(SourceKind::Generic) => f.write_str("No results for this request"),
            JobFailure::ImportFailed => f.write_str("Error while importing"),
            JobFailure::EmptyGraph => f.write_str("No data to process for this graph"),
            JobFailure::ClusteringFailed => f.write_str("Error while clustering"),
        }
    }
}

impl FromStr for JobFailure {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let failure = match s {
            "No HAL results for this request" => JobFailure::NoResults(SourceKind::Hal),
            "No arXiv results for this request" => JobFailure::NoResults(SourceKind::Arxiv),
            "No PubMed results for this request" => JobFailure::NoResults(SourceKind::Pubmed),
            "No Twitter results for this request" => JobFailure::NoResults(SourceKind::Twitter),
            "No results for this request" => JobFailure::NoResults(SourceKind::Generic),
            "Error while importing" => JobFailure::ImportFailed,
            "No data to process for this graph" => JobFailure::EmptyGraph,
            "Error while clustering" => JobFailure::ClusteringFailed,
            other => {
                return Err(crate::Error::InvalidInput(format!(
                    "unknown job failure: {other:?}"
                )))
            }
        };
        Ok(failure)
    }
}

// =============================================================================
// JobState
// =============================================================================

/// Lifecycle state of a job.
///
/// ```text
/// Queued → Retrieving → Importing → Clustering → Done | DoneWithLosses
///              ↘            ↘            ↘
///                         Errored
/// ```
///
/// File uploads skip `Retrieving` and enter at `Importing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Retrieving,
    Importing,
    Clustering,
    Done,
    /// Finished, but this many result rows were lost after retry exhaustion.
    DoneWithLosses { lost: u32 },
    Errored { failure: JobFailure },
}

impl JobState {
    /// Whether the current run has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Done | JobState::DoneWithLosses { .. } | JobState::Errored { .. }
        )
    }

    /// Check a transition against the lifecycle graph.
    pub fn can_transition_to(&self, next: &JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Queued, Retrieving) | (Queued, Importing) | (Queued, Clustering) => true,
            (Retrieving, Importing) | (Importing, Clustering) => true,
            // At-least-once delivery re-enters a running stage.
            (Retrieving, Retrieving) | (Importing, Importing) | (Clustering, Clustering) => true,
            (Clustering, Done) | (Clustering, DoneWithLosses { .. }) => true,
            (Retrieving, Errored { .. })
            | (Importing, Errored { .. })
            | (Clustering, Errored { .. }) => true,
            // A finished job may be clustered again with new parameters.
            (Done, Clustering) | (DoneWithLosses { .. }, Clustering) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => f.write_str("queued"),
            JobState::Retrieving => f.write_str("retrieving"),
            JobState::Importing => f.write_str("importing"),
            JobState::Clustering => f.write_str("clustering"),
            JobState::Done => f.write_str("done"),
            JobState::DoneWithLosses { lost } => write!(f, "done ({lost} results lost)"),
            JobState::Errored { failure } => write!(f, "errored: {failure}"),
        }
    }
}
