use std::path::Path;

use async_trait::async_trait;
use benchd_core::{BuildPhase, TaskDescriptor};
use tracing::debug;

use super::steps::{clear_score, finalize_score, ScriptSteps};
use super::{BenchmarkRunner, RunReport};
use crate::error::Result;

/// Evaluates a candidate feature extraction with the testbed's fixed
/// classifier: compile, train, test.
pub struct FeatureExtractionRunner {
    steps: ScriptSteps,
}

impl FeatureExtractionRunner {
    pub fn new(steps: ScriptSteps) -> Self {
        Self { steps }
    }
}

#[async_trait]
impl BenchmarkRunner for FeatureExtractionRunner {
    fn name(&self) -> &str {
        "feature-extraction"
    }

    fn phase(&self) -> BuildPhase {
        BuildPhase::FeatureExtraction
    }

    async fn run(&self, task: &TaskDescriptor, sandbox: &Path) -> Result<RunReport> {
        let phase = self.phase();
        let mut outputs = Vec::new();

        for step in ["compile", "train"] {
            if let Some(out) = self.steps.run(sandbox, step, phase, false).await? {
                outputs.push(out);
            }
        }
        clear_score(sandbox).await?;
        let test = self.steps.run(sandbox, "test", phase, true).await?;
        let score = finalize_score(sandbox, test.as_ref()).await?;
        outputs.extend(test);

        debug!(task = %task.id, score, "feature extraction evaluated");
        Ok(RunReport {
            score,
            steps: outputs,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn task(dir: &Path) -> TaskDescriptor {
        let path = dir.join("f.task");
        let body = TaskDescriptor::render(&dir.join("cand"), BuildPhase::FeatureExtraction);
        TaskDescriptor::parse(&path, &body).unwrap()
    }

    #[tokio::test]
    async fn runs_steps_in_order_and_reads_score() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = dir.path();
        std::fs::write(sandbox.join("compile.sh"), "echo compile >> order.txt\n").unwrap();
        std::fs::write(sandbox.join("train.sh"), "echo train >> order.txt\n").unwrap();
        std::fs::write(sandbox.join("test.sh"), "echo test >> order.txt\necho 0.42\n").unwrap();

        let runner = FeatureExtractionRunner::new(ScriptSteps::new(".sh", Duration::from_secs(10)));
        let report = runner.run(&task(sandbox), sandbox).await.unwrap();

        assert_eq!(report.score, 0.42);
        assert_eq!(report.steps.len(), 3);
        assert_eq!(
            std::fs::read_to_string(sandbox.join("order.txt")).unwrap(),
            "compile\ntrain\ntest\n"
        );
    }

    #[tokio::test]
    async fn score_left_from_an_earlier_run_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = dir.path();
        std::fs::write(sandbox.join("score"), "0").unwrap();
        std::fs::write(sandbox.join("test.sh"), "echo 0.87\n").unwrap();

        let runner = FeatureExtractionRunner::new(ScriptSteps::new(".sh", Duration::from_secs(10)));
        let report = runner.run(&task(sandbox), sandbox).await.unwrap();

        assert_eq!(report.score, 0.87);
        assert_eq!(std::fs::read_to_string(sandbox.join("score")).unwrap(), "0.87");
    }

    #[tokio::test]
    async fn failing_compile_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = dir.path();
        std::fs::write(sandbox.join("compile.sh"), "exit 1\n").unwrap();
        std::fs::write(sandbox.join("test.sh"), "touch ran\necho 1\n").unwrap();

        let runner = FeatureExtractionRunner::new(ScriptSteps::new(".sh", Duration::from_secs(10)));
        assert!(runner.run(&task(sandbox), sandbox).await.is_err());
        assert!(!sandbox.join("ran").exists());
    }
}
