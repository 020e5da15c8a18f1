use std::path::{Path, PathBuf};
use std::time::Duration;

use benchd_core::{BenchError, BuildPhase};
use thiserror::Error;

/// Errors raised while claiming, running or publishing a task.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Core(#[from] BenchError),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("grounding failed: {0}")]
    Grounding(String),

    #[error("no runner registered for build phase {0}")]
    NoRunner(BuildPhase),

    #[error("a runner for build phase {0} is already registered")]
    DuplicateRunner(BuildPhase),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl SchedulerError {
    /// Wrap an IO error with the path it concerned.
    pub fn io(path: impl AsRef<Path>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        move |source| SchedulerError::Io { path, source }
    }
}

/// Errors from a single build/train/test step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("script '{0}' not found in sandbox")]
    MissingScript(String),

    #[error("failed to launch '{step}': {source}")]
    Launch {
        step: String,
        #[source]
        source: std::io::Error,
    },

    #[error("step '{step}' exited with {code:?}: {stderr}")]
    Failed {
        step: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("step '{step}' timed out after {timeout:?}")]
    Timeout { step: String, timeout: Duration },

    #[error("missing required input '{0}' in sandbox")]
    MissingInput(String),

    #[error("invalid score: {0}")]
    InvalidScore(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
