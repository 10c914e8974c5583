//! Orchestrator configuration.
//!
//! Every struct has `Default` (values from [`linkage_core::defaults`]),
//! `from_env()` and chained `with_*` builders.

use std::str::FromStr;
use std::time::Duration;

use linkage_core::defaults;

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Engine parameters shared by every clustering run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusteringConfig {
    /// Evaluations per grid cell (at least 1).
    pub n_repeat: u32,
    pub max_inner_iterations: u32,
    pub max_outer_iterations: u32,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            n_repeat: defaults::N_REPEAT,
            max_inner_iterations: defaults::MAX_INNER_LDA,
            max_outer_iterations: defaults::MAX_OUTER_LDA,
        }
    }
}

impl ClusteringConfig {
    /// Load from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `LINKAGE_N_REPEAT` | `1` |
    /// | `LINKAGE_MAX_INNER_LDA` | `30` |
    /// | `LINKAGE_MAX_OUTER_LDA` | `10` |
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            n_repeat: env_parse("LINKAGE_N_REPEAT").unwrap_or(d.n_repeat).max(1),
            max_inner_iterations: env_parse("LINKAGE_MAX_INNER_LDA")
                .unwrap_or(d.max_inner_iterations),
            max_outer_iterations: env_parse("LINKAGE_MAX_OUTER_LDA")
                .unwrap_or(d.max_outer_iterations),
        }
    }

    pub fn with_n_repeat(mut self, n_repeat: u32) -> Self {
        self.n_repeat = n_repeat.max(1);
        self
    }

    pub fn with_max_inner_iterations(mut self, n: u32) -> Self {
        self.max_inner_iterations = n;
        self
    }

    pub fn with_max_outer_iterations(mut self, n: u32) -> Self {
        self.max_outer_iterations = n;
        self
    }
}

/// Bounded retry with a fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (at least 1).
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::PERSIST_MAX_ATTEMPTS,
            delay: Duration::from_millis(defaults::PERSIST_RETRY_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// | Variable | Default |
    /// |----------|---------|
    /// | `LINKAGE_PERSIST_MAX_ATTEMPTS` | `20` |
    /// | `LINKAGE_PERSIST_RETRY_DELAY_MS` | `1000` |
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_attempts: env_parse("LINKAGE_PERSIST_MAX_ATTEMPTS")
                .unwrap_or(d.max_attempts)
                .max(1),
            delay: env_parse("LINKAGE_PERSIST_RETRY_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.delay),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Everything the orchestrator needs besides its collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub clustering: ClusteringConfig,
    pub retry: RetryPolicy,
    /// Pause between an errored-state persist and the error event.
    pub error_notify_delay: Duration,
    /// Completion-event delay of clustering runs enqueued by an import.
    pub import_notify_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            clustering: ClusteringConfig::default(),
            retry: RetryPolicy::default(),
            error_notify_delay: Duration::from_millis(defaults::ERROR_NOTIFY_DELAY_MS),
            import_notify_delay: Duration::from_millis(defaults::IMPORT_NOTIFY_DELAY_MS),
        }
    }
}

impl OrchestratorConfig {
    /// | Variable | Default |
    /// |----------|---------|
    /// | `LINKAGE_ERROR_NOTIFY_DELAY_MS` | `1000` |
    /// | `LINKAGE_IMPORT_NOTIFY_DELAY_MS` | `2000` |
    ///
    /// plus the variables of [`ClusteringConfig`] and [`RetryPolicy`].
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            clustering: ClusteringConfig::from_env(),
            retry: RetryPolicy::from_env(),
            error_notify_delay: env_parse("LINKAGE_ERROR_NOTIFY_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.error_notify_delay),
            import_notify_delay: env_parse("LINKAGE_IMPORT_NOTIFY_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.import_notify_delay),
        }
    }

    pub fn with_clustering(mut self, clustering: ClusteringConfig) -> Self {
        self.clustering = clustering;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_error_notify_delay(mut self, delay: Duration) -> Self {
        self.error_notify_delay = delay;
        self
    }

    pub fn with_import_notify_delay(mut self, delay: Duration) -> Self {
        self.import_notify_delay = delay;
        self
    }
}
