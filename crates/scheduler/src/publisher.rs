//! Copying results back to the candidate folder and retiring the task.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use benchd_core::{BenchConfig, BenchError};
use tracing::{info, warn};

use crate::error::{Result, SchedulerError};
use crate::queue::{ClaimedTask, TaskQueue};
use crate::runner::steps::SCORE_FILE;
use crate::sandbox::replace_entry;
use crate::worker::{OutcomeStatus, TaskOutcome};

/// Outcome record written next to the score in the candidate folder.
pub const OUTCOME_FILE: &str = "benchmark.json";

/// What publishing accomplished.
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    /// Top-level sandbox entries copied into the candidate folder.
    pub copied: usize,
    /// Where the task file ended up.
    pub archived_to: Option<PathBuf>,
}

/// Publishes a finished task: results out, task file archived, sandbox gone.
pub struct ResultPublisher {
    config: Arc<BenchConfig>,
    queue: Arc<TaskQueue>,
}

impl ResultPublisher {
    pub fn new(config: Arc<BenchConfig>, queue: Arc<TaskQueue>) -> Self {
        Self { config, queue }
    }

    /// Publish a completed or failed task.
    ///
    /// Every step is attempted even if an earlier one fails; the first error
    /// is returned after the sandbox has been cleaned up.
    pub async fn publish(&self, task: &ClaimedTask, outcome: &TaskOutcome) -> Result<PublishReport> {
        let mut report = PublishReport::default();
        let mut first_error: Option<SchedulerError> = None;
        let mut keep = |r: Result<()>| {
            if let Err(e) = r {
                warn!(task = %outcome.task_id, error = %e, "publish step failed");
                first_error.get_or_insert(e);
            }
        };

        if outcome.status == OutcomeStatus::Failed {
            let score = task.sandbox.join(SCORE_FILE);
            keep(tokio::fs::write(&score, "0").await.map_err(SchedulerError::io(&score)));
        }

        match self.copy_results(&task.sandbox, &task.descriptor.candidate).await {
            Ok(n) => report.copied = n,
            Err(e) => keep(Err(e)),
        }
        keep(write_outcome(&task.descriptor.candidate, outcome).await);

        match self.queue.archive(&task.task_path).await {
            Ok(path) => report.archived_to = Some(path),
            Err(e) => keep(Err(e)),
        }
        keep(self.queue.sandboxes().destroy(&task.sandbox).await);

        info!(
            task = %outcome.task_id,
            status = ?outcome.status,
            score = outcome.score,
            elapsed_ms = outcome.duration_ms,
            copied = report.copied,
            "task finished"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Archive a task whose descriptor could not be parsed. Nothing ran, so
    /// there is no sandbox and nothing to copy.
    pub async fn reject(&self, task_path: &Path, error: &BenchError) -> Result<PathBuf> {
        warn!(task = %task_path.display(), error = %error, "rejecting malformed task");
        self.queue.archive(task_path).await
    }

    /// Copy every top-level sandbox entry not on the exclusion list into the
    /// candidate folder, replacing same-named entries.
    async fn copy_results(&self, sandbox: &Path, candidate: &Path) -> Result<usize> {
        let config = self.config.clone();
        let (sandbox, candidate) = (sandbox.to_path_buf(), candidate.to_path_buf());

        tokio::task::spawn_blocking(move || -> Result<usize> {
            std::fs::create_dir_all(&candidate).map_err(SchedulerError::io(&candidate))?;
            let mut copied = 0;
            for entry in std::fs::read_dir(&sandbox).map_err(SchedulerError::io(&sandbox))? {
                let entry = entry.map_err(SchedulerError::io(&sandbox))?;
                let name = entry.file_name();
                if config.is_excluded(&name.to_string_lossy()) {
                    continue;
                }
                let target = candidate.join(&name);
                replace_entry(&entry.path(), &target).map_err(SchedulerError::io(&target))?;
                copied += 1;
            }
            Ok(copied)
        })
        .await?
    }
}

async fn write_outcome(candidate: &Path, outcome: &TaskOutcome) -> Result<()> {
    let path = candidate.join(OUTCOME_FILE);
    let json = serde_json::to_vec_pretty(outcome)
        .map_err(|e| BenchError::Other(format!("failed to serialize outcome: {e}")))?;
    tokio::fs::write(&path, json).await.map_err(SchedulerError::io(&path))
}
