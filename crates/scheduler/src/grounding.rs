//! Grounding: materializing a candidate's source inside its sandbox.
//!
//! The grounding language itself lives outside this crate. The scheduler only
//! needs the narrow contract: candidate folder, source template folder and
//! target sandbox in, populated sandbox out.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use benchd_core::BenchConfig;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, SchedulerError};
use crate::publisher::OUTCOME_FILE;
use crate::runner::steps::SCORE_FILE;
use crate::sandbox::{copy_dir_all, copy_dir_except};

/// Results a previous evaluation left in the candidate folder. They are not
/// part of the candidate and must not leak into a new run.
const PUBLISHED_OUTPUTS: [&str; 2] = [SCORE_FILE, OUTCOME_FILE];

/// Populates a sandbox with a buildable rendition of a candidate.
#[async_trait]
pub trait GroundingStage: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn ground(&self, candidate: &Path, source: &Path, sandbox: &Path) -> Result<()>;
}

/// Build the grounding stage the config asks for.
pub fn from_config(config: &BenchConfig) -> Arc<dyn GroundingStage> {
    match &config.grounding.executable {
        Some(exe) => Arc::new(CommandGrounding::new(exe.clone(), config.step_timeout())),
        None => Arc::new(CopyGrounding),
    }
}

// ── CopyGrounding ───────────────────────────────────────────────────

/// Copies the source template into the sandbox, then the candidate folder on
/// top of it, so candidate files override template files of the same name.
/// Published results from earlier runs stay behind.
pub struct CopyGrounding;

#[async_trait]
impl GroundingStage for CopyGrounding {
    fn name(&self) -> &str {
        "copy"
    }

    async fn ground(&self, candidate: &Path, source: &Path, sandbox: &Path) -> Result<()> {
        if !candidate.is_dir() {
            return Err(SchedulerError::Grounding(format!(
                "candidate folder {} does not exist",
                candidate.display()
            )));
        }

        let (candidate, source, sandbox) =
            (candidate.to_path_buf(), source.to_path_buf(), sandbox.to_path_buf());
        tokio::task::spawn_blocking(move || -> Result<()> {
            if source.is_dir() {
                let n = copy_dir_all(&source, &sandbox).map_err(SchedulerError::io(&source))?;
                debug!(source = %source.display(), files = n, "source template copied");
            } else {
                debug!(source = %source.display(), "no source template, skipping");
            }
            let n = copy_dir_except(&candidate, &sandbox, &PUBLISHED_OUTPUTS)
                .map_err(SchedulerError::io(&candidate))?;
            debug!(candidate = %candidate.display(), files = n, "candidate copied");
            Ok(())
        })
        .await?
    }
}

// ── CommandGrounding ────────────────────────────────────────────────

/// Runs an external grounding program as
/// `<executable> <candidate> <source> <sandbox>`; exit code 0 means success.
pub struct CommandGrounding {
    executable: PathBuf,
    timeout: Duration,
}

impl CommandGrounding {
    pub fn new(executable: PathBuf, timeout: Duration) -> Self {
        Self { executable, timeout }
    }
}

#[async_trait]
impl GroundingStage for CommandGrounding {
    fn name(&self) -> &str {
        "command"
    }

    async fn ground(&self, candidate: &Path, source: &Path, sandbox: &Path) -> Result<()> {
        debug!(
            executable = %self.executable.display(),
            candidate = %candidate.display(),
            "running grounding executable"
        );

        let child = Command::new(&self.executable)
            .arg(candidate)
            .arg(source)
            .arg(sandbox)
            .current_dir(sandbox)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SchedulerError::Grounding(format!(
                    "failed to launch {}: {e}",
                    self.executable.display()
                ))
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(SchedulerError::Grounding(format!("grounding error: {e}"))),
            Err(_) => {
                warn!(timeout = ?self.timeout, "grounding timed out");
                return Err(SchedulerError::Grounding(format!(
                    "timed out after {:?}",
                    self.timeout
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SchedulerError::Grounding(format!(
                "exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(())
    }
}
