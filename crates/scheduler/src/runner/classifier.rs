use std::path::Path;

use async_trait::async_trait;
use benchd_core::{BuildPhase, TaskDescriptor};
use tracing::debug;

use super::steps::{clear_score, finalize_score, ScriptSteps};
use super::{BenchmarkRunner, RunReport};
use crate::error::{Result, StepError};

/// Trains and tests a candidate classifier on pre-extracted validation
/// instances shipped with the testbed.
pub struct ClassifierRunner {
    steps: ScriptSteps,
    validation_file: String,
}

impl ClassifierRunner {
    pub fn new(steps: ScriptSteps, validation_file: impl Into<String>) -> Self {
        Self {
            steps,
            validation_file: validation_file.into(),
        }
    }
}

#[async_trait]
impl BenchmarkRunner for ClassifierRunner {
    fn name(&self) -> &str {
        "classifier"
    }

    fn phase(&self) -> BuildPhase {
        BuildPhase::ClassifierDefinition
    }

    async fn run(&self, task: &TaskDescriptor, sandbox: &Path) -> Result<RunReport> {
        let phase = self.phase();
        let mut outputs = Vec::new();

        outputs.extend(self.steps.run(sandbox, "compile", phase, false).await?);

        if !sandbox.join(&self.validation_file).is_file() {
            return Err(StepError::MissingInput(self.validation_file.clone()).into());
        }

        outputs.extend(self.steps.run(sandbox, "train", phase, false).await?);
        clear_score(sandbox).await?;
        let test = self.steps.run(sandbox, "test", phase, true).await?;
        let score = finalize_score(sandbox, test.as_ref()).await?;
        outputs.extend(test);

        debug!(task = %task.id, score, "classifier evaluated");
        Ok(RunReport {
            score,
            steps: outputs,
        })
    }
}
