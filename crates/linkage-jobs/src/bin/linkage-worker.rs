//! linkage worker: runs retrieve, import and cluster tasks from the queue.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use linkage_db::{Database, PoolConfig};
use linkage_jobs::{
    stage_handlers, CommandEngine, CommandEngineConfig, ConnectorRegistry, CsvLinkParser,
    EventBus, Orchestrator, OrchestratorConfig, WorkerBuilder, WorkerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "linkage_jobs=info,linkage_db=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "linkage_jobs=info,linkage_db=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("linkage-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/linkage".to_string());
    let worker_config = WorkerConfig::from_env();
    let pool_config = PoolConfig::from_env().sized_for_workers(worker_config.max_concurrent_tasks);
    let db = Database::connect_with_config(&database_url, pool_config)
        .await
        .context("connecting to the database")?;
    db.migrate().await.context("running migrations")?;

    let engine = CommandEngine::new(
        CommandEngineConfig::from_env().context("configuring the graph engine")?,
    );
    let parser = CsvLinkParser::new().context("building the link parser")?;

    // Source connectors are registered by embedders; uploads need none.
    let connectors = ConnectorRegistry::new();

    let orchestrator = Arc::new(
        Orchestrator::builder()
            .with_graphs(Arc::new(db.graphs.clone()))
            .with_results(Arc::new(db.results.clone()))
            .with_tasks(db.tasks.clone())
            .with_connectors(connectors)
            .with_parser(Arc::new(parser))
            .with_engine(Arc::new(engine))
            .with_notifier(Arc::new(EventBus::default()))
            .with_config(OrchestratorConfig::from_env())
            .build()
            .context("building the orchestrator")?,
    );

    let worker = WorkerBuilder::new(db.tasks.clone())
        .with_config(worker_config)
        .with_handlers(stage_handlers(orchestrator))
        .with_wake(db.tasks.task_notify())
        .build()
        .await;
    let handle = worker.start();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");
    handle.shutdown().await.context("stopping the worker")?;

    Ok(())
}
