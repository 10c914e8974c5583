//! # linkage-core
//!
//! Core types, traits, and abstractions for the linkage job orchestrator.
//!
//! This crate provides the data model (jobs, grid parameters, result rows,
//! typed job steps and failures), the collaborator traits the orchestrator
//! depends on, and the per-user notification bus.

pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod state;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{ChannelKey, EventBus, EventEnvelope, JobEvent, JobEventKind};
pub use models::*;
pub use state::{classify_source_method, JobFailure, JobState, JobStep, SourceKind};
pub use traits::*;
pub use uuid_utils::new_v7;
