//! Centralized default constants for the linkage system.
//!
//! **This module is the single source of truth** for shared default values.
//! Configuration structs in other crates read their fallbacks from here.

// =============================================================================
// CLUSTERING
// =============================================================================

/// Number of times each grid cell is evaluated.
pub const N_REPEAT: u32 = 1;

/// Maximum inner LDA iterations passed to the engine.
pub const MAX_INNER_LDA: u32 = 30;

/// Maximum outer LDA iterations passed to the engine.
pub const MAX_OUTER_LDA: u32 = 10;

/// Exclusive upper bound of the random engine seed drawn when none is given.
pub const ENGINE_SEED_RANGE: u64 = 10_000;

/// Timeout for a full engine run in seconds (24 hours).
pub const ENGINE_TIMEOUT_SECS: u64 = 86_400;

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Attempts made by the retrying persister before giving up.
pub const PERSIST_MAX_ATTEMPTS: u32 = 20;

/// Fixed delay between persist attempts in milliseconds.
pub const PERSIST_RETRY_DELAY_MS: u64 = 1_000;

// =============================================================================
// NOTIFICATIONS
// =============================================================================

/// Delay before an error event is published, letting an in-flight
/// step-update event reach the UI first.
pub const ERROR_NOTIFY_DELAY_MS: u64 = 1_000;

/// Delay before the completion event of a clustering run enqueued by an import.
pub const IMPORT_NOTIFY_DELAY_MS: u64 = 2_000;

/// Buffer capacity of each per-user broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Prefix of per-user notification channel keys.
pub const CHANNEL_PREFIX: &str = "jobs";

// =============================================================================
// TASK QUEUE
// =============================================================================

/// Default maximum retry count for failed tasks.
pub const TASK_MAX_RETRIES: i32 = 3;

/// Default worker poll interval in milliseconds when the queue is empty.
pub const TASK_POLL_INTERVAL_MS: u64 = 500;

/// Default maximum concurrent tasks per worker.
pub const TASK_MAX_CONCURRENT: usize = 4;

/// Hard timeout for a single task, above the engine timeout so the engine's
/// own timeout fires first.
pub const TASK_TIMEOUT_SECS: u64 = ENGINE_TIMEOUT_SECS + 3_600;

// =============================================================================
// IMPORT
// =============================================================================

/// Minimum number of links a source must return to be worth importing.
pub const MIN_LINKS: usize = 2;

/// Minimum number of distinct labels a parsed graph needs to be clustered.
pub const MIN_LABELS: usize = 2;

/// Minimum token length kept in the term-document matrix.
pub const MIN_TERM_LEN: usize = 3;
