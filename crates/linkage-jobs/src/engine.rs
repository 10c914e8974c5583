//! External-command graph engine.
//!
//! The clustering executable receives the [`EngineRequest`] as JSON on stdin
//! and writes JSON lines on stdout:
//!
//! ```text
//! {"type":"progress","log":"...","units_done":3,"message":"..."}
//! {"type":"result","n_clusters":2,"n_topics":3,"clusters":[[...]],...,"crit":0.7}
//! {"type":"done","log":"..."}
//! ```
//!
//! Progress lines are forwarded to the [`ProgressSink`] as they arrive. Lines
//! that are not JSON or carry an unknown `type` are logged and skipped. A
//! `result` line that does not decode fails the run. The run succeeds only if
//! the process exits zero, emitted a `done` line and returned a result for
//! every grid cell.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use linkage_core::{
    defaults, EngineOutput, EngineRequest, Error, GraphEngine, ProgressSink, Result,
    ResultPayload,
};

/// Configuration for [`CommandEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEngineConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandEngineConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(defaults::ENGINE_TIMEOUT_SECS),
        }
    }

    /// | Variable | Default |
    /// |----------|---------|
    /// | `LINKAGE_ENGINE_CMD` | required; whitespace-separated program and args |
    /// | `LINKAGE_ENGINE_TIMEOUT_SECS` | `86400` |
    pub fn from_env() -> Result<Self> {
        let cmd = std::env::var("LINKAGE_ENGINE_CMD")
            .map_err(|_| Error::Config("LINKAGE_ENGINE_CMD is not set".into()))?;
        let mut parts = cmd.split_whitespace().map(String::from);
        let program = parts
            .next()
            .ok_or_else(|| Error::Config("LINKAGE_ENGINE_CMD is empty".into()))?;
        let timeout = std::env::var("LINKAGE_ENGINE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(defaults::ENGINE_TIMEOUT_SECS));
        Ok(Self {
            program,
            args: parts.collect(),
            timeout,
        })
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One stdout line of the engine protocol.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EngineLine {
    Progress {
        #[serde(default)]
        log: String,
        units_done: u64,
        #[serde(default)]
        message: String,
    },
    Result(ResultPayload),
    Done {
        #[serde(default)]
        log: String,
    },
}

/// Runs an external clustering executable per job.
pub struct CommandEngine {
    config: CommandEngineConfig,
}

impl CommandEngine {
    pub fn new(config: CommandEngineConfig) -> Self {
        Self { config }
    }

    async fn run(&self, request: &EngineRequest, progress: &ProgressSink) -> Result<EngineOutput> {
        let input = serde_json::to_vec(request)?;

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Engine(format!("failed to start {}: {e}", self.config.program))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Engine("engine stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Engine("engine stdout unavailable".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Engine("engine stderr unavailable".into()))?;

        let writer = tokio::spawn(async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        });
        let stderr_reader = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut output = EngineOutput::default();
        let mut finished = false;
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<EngineLine>(line) {
                Ok(EngineLine::Progress {
                    log,
                    units_done,
                    message,
                }) => {
                    progress.report(log, units_done, message);
                }
                Ok(EngineLine::Result(payload)) => {
                    output.results.insert(payload.cell(), payload);
                }
                Ok(EngineLine::Done { log }) => {
                    output.log = log;
                    finished = true;
                }
                Err(e) if is_result_line(line) => {
                    return Err(Error::Engine(format!("malformed result line: {e}")));
                }
                Err(e) => {
                    warn!(
                        subsystem = "jobs",
                        component = "engine",
                        error = %e,
                        "Ignoring unparseable engine output line"
                    );
                }
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_reader.await.unwrap_or_default();
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Engine closed stdin early"),
            Err(e) => debug!(error = %e, "Engine stdin writer failed"),
        }

        if !status.success() {
            return Err(Error::Engine(format!(
                "engine exited with {status}: {}",
                stderr.trim()
            )));
        }
        if !finished {
            return Err(Error::Engine("engine exited without a done line".into()));
        }
        let missing: Vec<String> = request
            .grid
            .cells()
            .filter(|cell| !output.results.contains_key(cell))
            .map(|cell| cell.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::Engine(format!(
                "engine returned no result for {}",
                missing.join(", ")
            )));
        }
        Ok(output)
    }
}

fn is_result_line(line: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "result"))
        .unwrap_or(false)
}

#[async_trait]
impl GraphEngine for CommandEngine {
    async fn process(&self, request: EngineRequest, progress: ProgressSink) -> Result<EngineOutput> {
        let start = Instant::now();
        let timeout = self.config.timeout;
        let output = tokio::time::timeout(timeout, self.run(&request, &progress))
            .await
            .map_err(|_| {
                Error::Engine(format!("engine timed out after {}s", timeout.as_secs()))
            })??;

        info!(
            subsystem = "jobs",
            component = "engine",
            op = "process",
            results = output.results.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Engine run finished"
        );
        Ok(output)
    }
}
