//! The per-worker poll loop and the per-task pipeline it drives.

use std::sync::Arc;
use std::time::{Duration, Instant};

use benchd_core::{BenchConfig, BuildPhase, ScanErrorPolicy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::Result;
use crate::grounding::GroundingStage;
use crate::perf::{PerformanceLog, TASK_INTERVAL};
use crate::pool::PoolState;
use crate::publisher::ResultPublisher;
use crate::queue::{Claim, ClaimedTask, TaskQueue};
use crate::runner::RunnerRegistry;

// ── Outcomes ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Failed,
}

/// Terminal record of one task, written to the candidate folder as
/// `benchmark.json`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub phase: BuildPhase,
    pub status: OutcomeStatus,
    /// Zero for failed tasks.
    pub score: f64,
    pub error: Option<String>,
    /// Runner that executed the task, if one was selected.
    pub runner: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Per-worker totals returned when a worker exits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub worker: usize,
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    /// Malformed task files archived without running.
    pub rejected: u64,
}

#[derive(Debug, Clone, Copy)]
enum TaskState {
    Claimed,
    Grounded,
    Executing,
    Completed,
    Failed,
}

// ── TaskContext ─────────────────────────────────────────────────────

/// Everything a worker needs to process tasks. Cheap to clone.
#[derive(Clone)]
pub struct TaskContext {
    pub config: Arc<BenchConfig>,
    pub queue: Arc<TaskQueue>,
    pub grounding: Arc<dyn GroundingStage>,
    pub runners: Arc<RunnerRegistry>,
    pub publisher: Arc<ResultPublisher>,
    pub perf: Arc<PerformanceLog>,
}

impl TaskContext {
    /// Ground, execute and publish one claimed task.
    ///
    /// Never fails: every error ends in a [`OutcomeStatus::Failed`] outcome
    /// that is published like a successful one.
    pub async fn process(&self, task: ClaimedTask) -> TaskOutcome {
        let started = Instant::now();
        let started_at = Utc::now();
        let id = task.descriptor.id.clone();
        transition(&id, TaskState::Claimed);

        let (runner_name, result) = self.execute_isolated(&task).await;

        let (status, score, error) = match result {
            Ok(score) => {
                transition(&id, TaskState::Completed);
                (OutcomeStatus::Completed, score, None)
            }
            Err(e) => {
                transition(&id, TaskState::Failed);
                warn!(task = %id, error = %e, "task failed");
                (OutcomeStatus::Failed, 0.0, Some(e.to_string()))
            }
        };

        let elapsed = started.elapsed();
        let outcome = TaskOutcome {
            task_id: id.clone(),
            phase: task.descriptor.phase,
            status,
            score,
            error,
            runner: runner_name,
            started_at,
            finished_at: Utc::now(),
            duration_ms: elapsed.as_millis() as u64,
        };

        if let Err(e) = self.publisher.publish(&task, &outcome).await {
            error!(task = %id, error = %e, "failed to publish results");
        }
        self.perf.record(TASK_INTERVAL, started.elapsed());
        outcome
    }

    /// Run grounding and the runner on their own tokio task so a panic in
    /// either ends as a failed outcome instead of taking the worker down.
    async fn execute_isolated(&self, task: &ClaimedTask) -> (Option<String>, Result<f64>) {
        let ctx = self.clone();
        let owned = task.clone();
        let handle = tokio::spawn(
            async move {
                let mut runner_name = None;
                let result = ctx.execute(&owned, &mut runner_name).await;
                (runner_name, result)
            }
            .in_current_span(),
        );
        // Aborting the worker must reach the task too.
        let _abort = AbortOnDrop(handle.abort_handle());

        match handle.await {
            Ok(done) => done,
            Err(e) => {
                error!(task = %task.descriptor.id, error = %e, "task execution panicked");
                (None, Err(e.into()))
            }
        }
    }

    async fn execute(&self, task: &ClaimedTask, runner_name: &mut Option<String>) -> Result<f64> {
        let id = &task.descriptor.id;
        self.grounding
            .ground(
                &task.descriptor.candidate,
                &self.config.grounding.source_dir,
                &task.sandbox,
            )
            .await?;
        transition(id, TaskState::Grounded);

        let runner = self.runners.get(task.descriptor.phase)?;
        *runner_name = Some(runner.name().to_string());
        transition(id, TaskState::Executing);

        let report = runner.run(&task.descriptor, &task.sandbox).await?;
        Ok(report.score)
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn transition(task: &str, state: TaskState) {
    debug!(task, state = ?state, "task state");
}

// ── Poll loop ───────────────────────────────────────────────────────

/// Run one worker until the pool leaves [`PoolState::Running`].
///
/// The state is checked at the top of every scan and before every claim, so
/// a drain request never interrupts a task already claimed.
pub async fn run_worker(
    id: usize,
    ctx: TaskContext,
    mut state: watch::Receiver<PoolState>,
) -> Result<WorkerSummary> {
    let mut summary = WorkerSummary {
        worker: id,
        ..Default::default()
    };
    let idle_interval = ctx.config.idle_interval();
    info!("worker started");

    'poll: loop {
        if !state.borrow().accepts_work() {
            break;
        }

        let tasks = match ctx.queue.scan().await {
            Ok(tasks) => tasks,
            Err(e) => match ctx.config.queue.scan_error_policy {
                ScanErrorPolicy::Retry => {
                    warn!(error = %e, "scan failed, retrying");
                    if !idle(&mut state, idle_interval).await {
                        break;
                    }
                    continue;
                }
                ScanErrorPolicy::FailFast => {
                    error!(error = %e, "scan failed, stopping worker");
                    return Err(e);
                }
            },
        };

        let mut claimed_any = false;
        for path in tasks {
            if !state.borrow().accepts_work() {
                break 'poll;
            }
            match ctx.queue.claim(&path).await {
                Ok(None) => {}
                Ok(Some(Claim::Rejected { task_path, error })) => {
                    claimed_any = true;
                    summary.rejected += 1;
                    if let Err(e) = ctx.publisher.reject(&task_path, &error).await {
                        warn!(task = %task_path.display(), error = %e, "failed to archive rejected task");
                    }
                }
                Ok(Some(Claim::Claimed(task))) => {
                    claimed_any = true;
                    summary.claimed += 1;
                    info!(task = %task.descriptor.id, phase = %task.descriptor.phase, "task claimed");
                    match ctx.process(task).await.status {
                        OutcomeStatus::Completed => summary.completed += 1,
                        OutcomeStatus::Failed => summary.failed += 1,
                    }
                }
                Err(e) => {
                    warn!(task = %path.display(), error = %e, "claim failed, will retry");
                }
            }
        }

        if !claimed_any && !idle(&mut state, idle_interval).await {
            break;
        }
    }

    info!(
        claimed = summary.claimed,
        completed = summary.completed,
        failed = summary.failed,
        "worker stopped"
    );
    Ok(summary)
}

/// Sleep for `interval` or until the pool state changes. Returns false once
/// the pool has gone away.
async fn idle(state: &mut watch::Receiver<PoolState>, interval: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => true,
        changed = state.changed() => changed.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulerError;
    use crate::registry::DedupRegistry;
    use crate::runner::{BenchmarkRunner, RunReport};
    use async_trait::async_trait;
    use benchd_core::TaskDescriptor;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopGrounding {
        fail: bool,
    }

    #[async_trait]
    impl GroundingStage for NoopGrounding {
        fn name(&self) -> &str {
            "noop"
        }

        async fn ground(&self, _c: &Path, _s: &Path, _sb: &Path) -> Result<()> {
            if self.fail {
                return Err(SchedulerError::Grounding("no grammar".into()));
            }
            Ok(())
        }
    }

    struct CountingRunner {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl BenchmarkRunner for CountingRunner {
        fn name(&self) -> &str {
            "counting"
        }

        fn phase(&self) -> BuildPhase {
            BuildPhase::FeatureExtraction
        }

        async fn run(&self, _task: &TaskDescriptor, sandbox: &Path) -> Result<RunReport> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            std::fs::write(sandbox.join("score"), "0.6").unwrap();
            Ok(RunReport {
                score: 0.6,
                steps: Vec::new(),
            })
        }
    }

    struct PanickingRunner;

    #[async_trait]
    impl BenchmarkRunner for PanickingRunner {
        fn name(&self) -> &str {
            "panicking"
        }

        fn phase(&self) -> BuildPhase {
            BuildPhase::ClassifierDefinition
        }

        async fn run(&self, _task: &TaskDescriptor, _sandbox: &Path) -> Result<RunReport> {
            panic!("runner blew up");
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        ctx: TaskContext,
        runner: Arc<CountingRunner>,
    }

    fn harness(grounding_fails: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BenchConfig::default();
        config.queue.waiting_dir = dir.path().join("waiting");
        config.queue.finished_dir = dir.path().join("finished");
        config.queue.idle_interval_ms = 20;
        config.sandbox.testbed_dir = dir.path().join("testbed");
        std::fs::create_dir_all(&config.sandbox.testbed_dir).unwrap();
        let config = Arc::new(config);

        let queue = Arc::new(TaskQueue::new(config.clone(), Arc::new(DedupRegistry::new())));
        queue.ensure_dirs().unwrap();
        let runner = Arc::new(CountingRunner {
            runs: AtomicUsize::new(0),
        });
        let mut runners = RunnerRegistry::new();
        runners.register(runner.clone()).unwrap();

        let ctx = TaskContext {
            publisher: Arc::new(ResultPublisher::new(config.clone(), queue.clone())),
            config,
            queue,
            grounding: Arc::new(NoopGrounding {
                fail: grounding_fails,
            }),
            runners: Arc::new(runners),
            perf: Arc::new(PerformanceLog::new()),
        };
        Harness { dir, ctx, runner }
    }

    impl Harness {
        fn submit(&self, name: &str, phase: BuildPhase) -> PathBuf {
            self.ctx
                .queue
                .submit(&self.dir.path().join("cands").join(name), phase, None)
                .unwrap()
        }

        async fn claim(&self, path: &Path) -> ClaimedTask {
            match self.ctx.queue.claim(path).await.unwrap() {
                Some(Claim::Claimed(task)) => task,
                other => panic!("unexpected claim result: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn successful_task_is_completed_and_archived() {
        let h = harness(false);
        let path = h.submit("c1", BuildPhase::FeatureExtraction);
        let task = h.claim(&path).await;
        let sandbox = task.sandbox.clone();

        let outcome = h.ctx.process(task).await;
        assert_eq!(outcome.status, OutcomeStatus::Completed);
        assert_eq!(outcome.score, 0.6);
        assert_eq!(outcome.runner.as_deref(), Some("counting"));
        assert!(!sandbox.exists());
        assert!(h.ctx.config.queue.finished_dir.join("c1.task").exists());
        assert_eq!(h.ctx.perf.snapshot()[TASK_INTERVAL].count, 1);
    }

    #[tokio::test]
    async fn grounding_failure_skips_runner() {
        let h = harness(true);
        let path = h.submit("c2", BuildPhase::FeatureExtraction);
        let task = h.claim(&path).await;

        let outcome = h.ctx.process(task).await;
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.score, 0.0);
        assert!(outcome.error.unwrap().contains("no grammar"));
        assert_eq!(h.runner.runs.load(Ordering::SeqCst), 0);
        assert!(h.ctx.config.queue.finished_dir.join("c2.task").exists());
    }

    #[tokio::test]
    async fn missing_runner_fails_task() {
        let h = harness(false);
        let path = h.submit("c3", BuildPhase::ClassifierDefinition);
        let task = h.claim(&path).await;

        let outcome = h.ctx.process(task).await;
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.runner.is_none());
        let score = h.dir.path().join("cands/c3/score");
        assert_eq!(std::fs::read_to_string(score).unwrap(), "0");
    }

    #[tokio::test]
    async fn worker_drains_queue_then_stops_on_request() {
        let h = harness(false);
        h.submit("a", BuildPhase::FeatureExtraction);
        h.submit("b", BuildPhase::FeatureExtraction);
        std::fs::write(h.ctx.config.queue.waiting_dir.join("bad.task"), "nope").unwrap();

        let (tx, rx) = watch::channel(PoolState::Running);
        let handle = tokio::spawn(run_worker(0, h.ctx.clone(), rx));

        let finished = h.ctx.config.queue.finished_dir.clone();
        for _ in 0..200 {
            if std::fs::read_dir(&finished).unwrap().count() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(PoolState::DrainRequested).unwrap();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.claimed, 2);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.rejected, 1);
        assert_eq!(h.runner.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fail_fast_policy_stops_on_scan_error() {
        let h = harness(false);
        let mut config = (*h.ctx.config).clone();
        config.queue.scan_error_policy = ScanErrorPolicy::FailFast;
        std::fs::remove_dir_all(&config.queue.waiting_dir).unwrap();
        let ctx = TaskContext {
            config: Arc::new(config),
            ..h.ctx.clone()
        };

        let (_tx, rx) = watch::channel(PoolState::Running);
        assert!(run_worker(0, ctx, rx).await.is_err());
    }

    #[tokio::test]
    async fn retry_policy_survives_scan_errors() {
        let h = harness(false);
        std::fs::remove_dir_all(&h.ctx.config.queue.waiting_dir).unwrap();

        let (tx, rx) = watch::channel(PoolState::Running);
        let handle = tokio::spawn(run_worker(1, h.ctx.clone(), rx));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!handle.is_finished());

        tx.send(PoolState::DrainRequested).unwrap();
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.worker, 1);
        assert!(h.ctx.queue.scan_count() >= 2);
    }

    #[tokio::test]
    async fn panicking_runner_fails_task_and_worker_keeps_going() {
        let h = harness(false);
        let mut runners = RunnerRegistry::new();
        runners.register(h.runner.clone()).unwrap();
        runners.register(Arc::new(PanickingRunner)).unwrap();
        let ctx = TaskContext {
            runners: Arc::new(runners),
            ..h.ctx.clone()
        };
        h.submit("boom", BuildPhase::ClassifierDefinition);
        h.submit("fine", BuildPhase::FeatureExtraction);

        let (tx, rx) = watch::channel(PoolState::Running);
        let handle = tokio::spawn(run_worker(0, ctx.clone(), rx));

        let finished = ctx.config.queue.finished_dir.clone();
        for _ in 0..200 {
            if std::fs::read_dir(&finished).unwrap().count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(PoolState::DrainRequested).unwrap();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.claimed, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert!(finished.join("boom.task").exists());
        assert!(!ctx.config.sandbox_path_for("boom").exists());

        let candidate = h.dir.path().join("cands/boom");
        assert_eq!(std::fs::read_to_string(candidate.join("score")).unwrap(), "0");
        let record: serde_json::Value =
            serde_json::from_slice(&std::fs::read(candidate.join("benchmark.json")).unwrap()).unwrap();
        assert_eq!(record["status"], "failed");
        assert!(record["error"].as_str().unwrap().contains("panicked"));
    }
}
