//! The Executor collaborator boundary, plus the subprocess-backed
//! implementation the binary ships with.
//!
//! The scheduler never lets an executor failure skip the counter
//! decrement or leave an item stuck in_progress; that guarantee lives in
//! the scheduler, not here.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::failure::FailureCategory;
use crate::model::work::WorkItem;
use crate::model::worker::Worker;
use serde::Deserialize;

/// Outcome of a single execution.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionReport {
    /// Identifier of whatever artifact the executor produced, if any.
    pub deliverable_id: Option<Uuid>,
    /// Provider usage accounting, opaque here.
    pub usage: Option<serde_json::Value>,
}

/// A failed execution: raw message plus an optional category supplied by
/// the executor itself. When absent, the classifier maps the message.
#[derive(Debug, Clone)]
pub struct ExecutionError {
    pub message: String,
    pub category: Option<FailureCategory>,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: None,
        }
    }

    /// Final category: executor-supplied when present, classified from
    /// the message otherwise.
    pub fn resolve_category(&self) -> FailureCategory {
        self.category
            .unwrap_or_else(|| FailureCategory::classify(&self.message))
    }
}

/// External execution collaborator. Implementations enforce their own
/// timeouts; the scheduler treats a call that never returns as a bug in
/// the implementation, not something to paper over with a blocking wait.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        worker: &Worker,
        item: &WorkItem,
    ) -> std::result::Result<ExecutionReport, ExecutionError>;
}

/// Subprocess executor: hands the worker and work item over as JSON
/// files in a scratch directory, runs the configured command there, and
/// reads `report.json` back.
pub struct CommandExecutor {
    command: PathBuf,
    base_dir: PathBuf,
}

impl CommandExecutor {
    pub fn new(command: PathBuf, base_dir: PathBuf) -> Self {
        Self { command, base_dir }
    }

    async fn run_in_dir(&self, worker: &Worker, item: &WorkItem, dir: &Path) -> Result<ExecutionReport> {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join("work.json"), serde_json::to_string_pretty(item)?).await?;
        tokio::fs::write(
            dir.join("worker.json"),
            serde_json::to_string_pretty(worker)?,
        )
        .await?;

        // Resolve relative command paths against the process CWD, not the
        // scratch dir. Command::new + current_dir resolves relative paths
        // after chdir, which would look in the scratch dir instead.
        let abs_command = if self.command.is_relative() {
            std::env::current_dir()?.join(&self.command)
        } else {
            self.command.clone()
        };

        debug!(
            work_id = %item.id,
            command = %abs_command.display(),
            "running executor command"
        );

        let mut command = Command::new(&abs_command);
        command
            .current_dir(dir)
            .env("TASKMILL_WORK_DIR", dir)
            .env("TASKMILL_WORK_ID", item.id.0.to_string())
            .env("TASKMILL_WORKER_ID", worker.id.0.to_string());
        // Credentials go over the environment, never into the handoff
        // files on disk.
        if let Some(credentials) = &worker.credentials {
            command.env("TASKMILL_WORKER_CREDENTIALS", credentials);
        }
        let status = command.status().await?;

        if !status.success() {
            return Err(Error::Execution(format!(
                "executor command exited with status {}",
                status.code().unwrap_or(-1)
            )));
        }

        let content = tokio::fs::read_to_string(dir.join("report.json"))
            .await
            .map_err(|e| Error::Execution(format!("missing report.json: {e}")))?;
        let report: ExecutionReport = serde_json::from_str(&content)
            .map_err(|e| Error::Execution(format!("bad report.json: {e}")))?;
        Ok(report)
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(
        &self,
        worker: &Worker,
        item: &WorkItem,
    ) -> std::result::Result<ExecutionReport, ExecutionError> {
        let dir = self.base_dir.join(item.id.0.to_string());
        let result = self.run_in_dir(worker, item, &dir).await;
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            debug!(work_id = %item.id, "scratch dir cleanup failed: {e}");
        }
        result.map_err(|e| ExecutionError::new(e.to_string()))
    }
}
