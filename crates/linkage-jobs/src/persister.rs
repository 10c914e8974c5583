//! Retrying persister: bounded retry around a single write.
//!
//! Used for result rows and terminal job-state writes. Exhaustion is logged
//! and reported in the returned [`PersistOutcome`], never raised. A write
//! against a deleted graph stops at once with [`PersistOutcome::GraphGone`].
//! Stage transition writes use [`persist_once`] instead.

use std::future::Future;

use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use linkage_core::{Error, Result};

use crate::config::RetryPolicy;

/// Outcome of a retried write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Saved { attempts: u32 },
    Exhausted { attempts: u32, last_error: String },
    /// The graph no longer exists; retrying cannot succeed.
    GraphGone { attempts: u32 },
}

impl PersistOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, PersistOutcome::Saved { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PersistOutcome::Saved { attempts }
            | PersistOutcome::Exhausted { attempts, .. }
            | PersistOutcome::GraphGone { attempts } => *attempts,
        }
    }
}

/// Wraps persist operations with the configured retry policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryingPersister {
    policy: RetryPolicy,
}

impl RetryingPersister {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `op` until it succeeds or the attempt budget is spent, sleeping the
    /// fixed delay between attempts.
    pub async fn persist<F, Fut, T>(&self, what: &'static str, graph_id: Uuid, mut op: F) -> PersistOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match op().await {
                Ok(_) => return PersistOutcome::Saved { attempts: attempt },
                Err(Error::GraphNotFound(_)) => {
                    info!(
                        subsystem = "jobs",
                        component = "persister",
                        op = "persist",
                        entity = what,
                        %graph_id,
                        attempt,
                        "Graph deleted, write dropped"
                    );
                    return PersistOutcome::GraphGone { attempts: attempt };
                }
                Err(e) => {
                    warn!(
                        subsystem = "jobs",
                        component = "persister",
                        op = "persist",
                        entity = what,
                        %graph_id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Persist attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
            if attempt < max_attempts {
                sleep(self.policy.delay).await;
            }
        }

        error!(
            subsystem = "jobs",
            component = "persister",
            op = "persist",
            entity = what,
            %graph_id,
            attempts = max_attempts,
            error = %last_error,
            "Persist retries exhausted, write dropped"
        );
        PersistOutcome::Exhausted {
            attempts: max_attempts,
            last_error,
        }
    }
}

/// Single best-effort attempt for state-transition writes. Returns whether the
/// write succeeded.
pub async fn persist_once<Fut, T>(what: &'static str, graph_id: Uuid, fut: Fut) -> bool
where
    Fut: Future<Output = Result<T>>,
{
    match fut.await {
        Ok(_) => true,
        Err(e) => {
            warn!(
                subsystem = "jobs",
                component = "persister",
                op = "persist_once",
                entity = what,
                %graph_id,
                error = %e,
                "Could not save job progress"
            );
            false
        }
    }
}
