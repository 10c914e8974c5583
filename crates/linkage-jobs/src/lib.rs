//! # linkage-jobs
//!
//! Job orchestration for linkage.
//!
//! This crate provides:
//! - The job state machine (retrieve → import → cluster)
//! - Bounded-retry persistence for result rows and terminal job writes
//! - Progress tracking through a single-writer mailbox
//! - A task worker dispatching queued stages to their handlers
//! - A CSV link parser and an external-command graph engine
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use linkage_jobs::{stage_handlers, Orchestrator, WorkerBuilder, WorkerConfig};
//!
//! let orchestrator = Arc::new(
//!     Orchestrator::builder()
//!         .with_store(store.clone())
//!         .with_parser(Arc::new(CsvLinkParser::new()?))
//!         .with_engine(Arc::new(engine))
//!         .with_notifier(Arc::new(EventBus::default()))
//!         .build()?,
//! );
//!
//! let handle = WorkerBuilder::new(Arc::new(store))
//!     .with_config(WorkerConfig::from_env())
//!     .with_handlers(stage_handlers(orchestrator.clone()))
//!     .build()
//!     .await
//!     .start();
//!
//! let graph = orchestrator.create_graph(user_id, "citations", grid, false).await?;
//! orchestrator.submit_retrieval(graph.id, "hal_search", params).await?;
//!
//! handle.shutdown().await?;
//! ```

pub mod config;
pub mod connectors;
pub mod csv_parser;
pub mod engine;
pub mod handler;
pub mod orchestrator;
pub mod persister;
pub mod progress;
pub mod worker;

// Re-export core types
pub use linkage_core::*;

pub use config::{ClusteringConfig, OrchestratorConfig, RetryPolicy};
pub use connectors::ConnectorRegistry;
pub use csv_parser::{parse_csv_records, CsvLinkParser};
pub use engine::{CommandEngine, CommandEngineConfig};
pub use handler::{
    stage_handlers, ClusterHandler, ImportHandler, RetrieveHandler, TaskContext, TaskHandler,
    TaskResult,
};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, StageOutcome};
pub use persister::{persist_once, PersistOutcome, RetryingPersister};
pub use progress::{MailboxHandle, Observation, ProgressMailbox, ProgressTracker, ProgressUpdate};
pub use worker::{TaskWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};
