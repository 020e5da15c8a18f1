//! Script steps executed inside a sandbox.
//!
//! A testbed ships `compile`, `train` and `test` scripts with the platform
//! extension. Each runs with the sandbox as working directory and the build
//! phase tag as its first argument.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use benchd_core::{BenchConfig, BuildPhase};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, SchedulerError, StepError};

/// Name of the score file inside the sandbox.
pub const SCORE_FILE: &str = "score";

/// Captured result of one finished script.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub step: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Script runner settings shared by all runners.
#[derive(Debug, Clone)]
pub struct ScriptSteps {
    extension: String,
    timeout: Duration,
}

impl ScriptSteps {
    pub fn new(extension: impl Into<String>, timeout: Duration) -> Self {
        Self {
            extension: extension.into(),
            timeout,
        }
    }

    pub fn from_config(config: &BenchConfig) -> Self {
        Self::new(config.script_extension(), config.step_timeout())
    }

    pub fn script_name(&self, step: &str) -> String {
        format!("{step}{}", self.extension)
    }

    /// Run `<step><ext> <phase>` in the sandbox.
    ///
    /// A missing optional script is skipped and yields `Ok(None)`; a missing
    /// required one is an error. A non-zero exit fails the step.
    pub async fn run(
        &self,
        sandbox: &Path,
        step: &str,
        phase: BuildPhase,
        required: bool,
    ) -> std::result::Result<Option<StepOutput>, StepError> {
        let script = self.script_name(step);
        let path = sandbox.join(&script);
        if !path.is_file() {
            if required {
                return Err(StepError::MissingScript(script));
            }
            debug!(step, sandbox = %sandbox.display(), "no script, skipping step");
            return Ok(None);
        }

        let mut command = interpreter_for(&self.extension, &path);
        command
            .arg(phase.as_str())
            .current_dir(sandbox)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(step, script = %path.display(), timeout = ?self.timeout, "running step");
        let started = Instant::now();
        let child = command.spawn().map_err(|source| StepError::Launch {
            step: step.to_string(),
            source,
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(StepError::Launch {
                    step: step.to_string(),
                    source,
                })
            }
            Err(_) => {
                warn!(step, timeout = ?self.timeout, "step timed out");
                return Err(StepError::Timeout {
                    step: step.to_string(),
                    timeout: self.timeout,
                });
            }
        };

        let result = StepOutput {
            step: step.to_string(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: started.elapsed(),
        };

        if !output.status.success() {
            return Err(StepError::Failed {
                step: result.step,
                code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
            });
        }
        debug!(step, elapsed_ms = result.duration.as_millis() as u64, "step finished");
        Ok(Some(result))
    }
}

fn interpreter_for(extension: &str, script: &Path) -> Command {
    match extension.to_ascii_lowercase().as_str() {
        ".sh" => {
            let mut cmd = Command::new("sh");
            cmd.arg(script);
            cmd
        }
        ".bat" | ".cmd" => {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(script);
            cmd
        }
        _ => Command::new(script),
    }
}

/// Remove any score file already in the sandbox so only the coming test step
/// can produce one.
pub async fn clear_score(sandbox: &Path) -> Result<()> {
    let score_path = sandbox.join(SCORE_FILE);
    match tokio::fs::remove_file(&score_path).await {
        Ok(()) => {
            debug!(sandbox = %sandbox.display(), "removed stale score file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SchedulerError::io(&score_path)(e)),
    }
}

/// Determine the task score and leave it normalized in `<sandbox>/score`.
///
/// The test step either writes the score file itself or prints the score as
/// its last non-empty stdout line.
pub async fn finalize_score(sandbox: &Path, test_output: Option<&StepOutput>) -> Result<f64> {
    let score_path = sandbox.join(SCORE_FILE);
    let raw = match tokio::fs::read_to_string(&score_path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => test_output
            .and_then(|out| out.stdout.lines().rev().find(|l| !l.trim().is_empty()))
            .map(str::to_string)
            .ok_or_else(|| StepError::InvalidScore("test step produced no score".into()))?,
        Err(e) => return Err(SchedulerError::io(&score_path)(e)),
    };

    let score = parse_score(&raw)?;
    tokio::fs::write(&score_path, score.to_string())
        .await
        .map_err(SchedulerError::io(&score_path))?;
    Ok(score)
}

/// Parse a score: a finite, non-negative decimal.
pub fn parse_score(raw: &str) -> std::result::Result<f64, StepError> {
    let trimmed = raw.trim();
    let score: f64 = trimmed
        .parse()
        .map_err(|_| StepError::InvalidScore(format!("'{trimmed}' is not a number")))?;
    if !score.is_finite() || score < 0.0 {
        return Err(StepError::InvalidScore(format!("{score} is out of range")));
    }
    Ok(score)
}
