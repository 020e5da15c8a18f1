//! Per-phase benchmark runners and the dispatch table selecting them.

mod classifier;
mod feature;
pub mod steps;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use benchd_core::{BenchConfig, BuildPhase, TaskDescriptor};

use crate::error::{Result, SchedulerError};

pub use classifier::ClassifierRunner;
pub use feature::FeatureExtractionRunner;
pub use steps::{ScriptSteps, StepOutput};

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Non-negative score, also written to `<sandbox>/score`.
    pub score: f64,
    /// Steps that actually ran, in order.
    pub steps: Vec<StepOutput>,
}

/// Builds and evaluates a grounded candidate for one build phase.
#[async_trait]
pub trait BenchmarkRunner: Send + Sync {
    fn name(&self) -> &str;

    /// The build phase this runner handles.
    fn phase(&self) -> BuildPhase;

    async fn run(&self, task: &TaskDescriptor, sandbox: &Path) -> Result<RunReport>;
}

/// Build phase → runner lookup.
pub struct RunnerRegistry {
    runners: HashMap<BuildPhase, Arc<dyn BenchmarkRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self {
            runners: HashMap::new(),
        }
    }

    /// Registry with the script runners for every build phase.
    pub fn from_config(config: &BenchConfig) -> Self {
        let steps = ScriptSteps::from_config(config);
        let mut registry = Self::new();
        registry.insert(Arc::new(FeatureExtractionRunner::new(steps.clone())));
        registry.insert(Arc::new(ClassifierRunner::new(
            steps,
            config.runner.validation_file.clone(),
        )));
        registry
    }

    /// Register a runner. Returns error if its phase already has one.
    pub fn register(&mut self, runner: Arc<dyn BenchmarkRunner>) -> Result<()> {
        let phase = runner.phase();
        if self.runners.contains_key(&phase) {
            return Err(SchedulerError::DuplicateRunner(phase));
        }
        self.runners.insert(phase, runner);
        Ok(())
    }

    /// Register a runner, replacing any previous one for the same phase.
    pub fn insert(&mut self, runner: Arc<dyn BenchmarkRunner>) -> Option<Arc<dyn BenchmarkRunner>> {
        self.runners.insert(runner.phase(), runner)
    }

    pub fn get(&self, phase: BuildPhase) -> Result<Arc<dyn BenchmarkRunner>> {
        self.runners
            .get(&phase)
            .cloned()
            .ok_or(SchedulerError::NoRunner(phase))
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
