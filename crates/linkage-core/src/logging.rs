//! Structured logging schema and field name constants for linkage.
//!
//! All crates use these constants for consistent structured logging fields.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Persistence exhausted, worker faults |
//! | WARN  | Recoverable issue: single persist failure, publish failure, retry attempt |
//! | INFO  | Stage transitions, task start/finish, lifecycle events |
//! | DEBUG | Decision points, config choices |
//! | TRACE | Per-callback progress |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "jobs", "db", "events"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "orchestrator", "persister", "progress", "worker", "pool"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "retrieve", "import", "cluster", "persist", "claim_next"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Graph (job) UUID being operated on.
pub const GRAPH_ID: &str = "graph_id";

/// Task UUID being processed.
pub const TASK_ID: &str = "task_id";

/// Task kind enum variant.
pub const TASK_KIND: &str = "task_kind";

/// Source connector method name.
pub const METHOD: &str = "method";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Attempt index of a retried operation (1-based).
pub const ATTEMPT: &str = "attempt";

/// Completed engine units.
pub const UNITS_DONE: &str = "units_done";

/// Total engine units of a clustering run.
pub const UNITS_TOTAL: &str = "units_total";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
