//! Fixed-size pool of poll-loop workers sharing one queue and registry.

use std::sync::Arc;

use benchd_core::BenchConfig;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{info, info_span, Instrument};

use crate::error::Result;
use crate::grounding::{self, GroundingStage};
use crate::perf::{PerformanceLog, UPTIME};
use crate::publisher::ResultPublisher;
use crate::queue::TaskQueue;
use crate::registry::DedupRegistry;
use crate::runner::{BenchmarkRunner, RunnerRegistry};
use crate::worker::{run_worker, TaskContext, WorkerSummary};

/// Lifecycle of the pool, broadcast to every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Running,
    /// Finish in-flight tasks, claim nothing new.
    DrainRequested,
    /// Interrupt in-flight tasks.
    ForceStopRequested,
    Stopped,
}

impl PoolState {
    pub fn accepts_work(self) -> bool {
        self == PoolState::Running
    }
}

/// Result of one worker task: the worker's own result, or a join error if
/// it panicked or was aborted.
pub type WorkerExit = std::result::Result<Result<WorkerSummary>, JoinError>;

// ── WorkerPoolBuilder ───────────────────────────────────────────────

/// Fluent builder for a [`WorkerPool`]. Anything not set explicitly is
/// derived from the config.
pub struct WorkerPoolBuilder {
    config: Arc<BenchConfig>,
    registry: Option<Arc<DedupRegistry>>,
    grounding: Option<Arc<dyn GroundingStage>>,
    runners: Option<RunnerRegistry>,
    perf: Option<Arc<PerformanceLog>>,
}

impl WorkerPoolBuilder {
    pub fn new(config: Arc<BenchConfig>) -> Self {
        Self {
            config,
            registry: None,
            grounding: None,
            runners: None,
            perf: None,
        }
    }

    pub fn registry(mut self, registry: Arc<DedupRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn grounding(mut self, grounding: Arc<dyn GroundingStage>) -> Self {
        self.grounding = Some(grounding);
        self
    }

    /// Replace the whole runner table.
    pub fn runners(mut self, runners: RunnerRegistry) -> Self {
        self.runners = Some(runners);
        self
    }

    /// Override the runner for one phase, keeping the defaults for the rest.
    pub fn runner(mut self, runner: Arc<dyn BenchmarkRunner>) -> Self {
        let runners = self
            .runners
            .get_or_insert_with(|| RunnerRegistry::from_config(&self.config));
        runners.insert(runner);
        self
    }

    pub fn perf(mut self, perf: Arc<PerformanceLog>) -> Self {
        self.perf = Some(perf);
        self
    }

    /// Prepare the queue directories and spawn the workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<WorkerPool> {
        let config = self.config;
        let registry = self.registry.unwrap_or_default();
        let queue = Arc::new(TaskQueue::new(config.clone(), registry));
        queue.ensure_dirs()?;
        let recovered = queue.recover_in_progress()?;
        if recovered > 0 {
            info!(recovered, "returned interrupted tasks to the waiting queue");
        }

        let perf = self.perf.unwrap_or_default();
        let ctx = TaskContext {
            grounding: self
                .grounding
                .unwrap_or_else(|| grounding::from_config(&config)),
            runners: Arc::new(
                self.runners
                    .unwrap_or_else(|| RunnerRegistry::from_config(&config)),
            ),
            publisher: Arc::new(ResultPublisher::new(config.clone(), queue.clone())),
            queue,
            perf: perf.clone(),
            config: config.clone(),
        };

        perf.log_start(UPTIME);
        let (state, _) = watch::channel(PoolState::Running);
        let mut workers = JoinSet::new();
        for id in 0..config.pool.workers {
            let worker = run_worker(id, ctx.clone(), state.subscribe());
            workers.spawn(worker.instrument(info_span!("worker", id)));
        }

        info!(
            workers = config.pool.workers,
            claim_mode = ?config.queue.claim_mode,
            grounding = ctx.grounding.name(),
            "worker pool started"
        );
        Ok(WorkerPool {
            ctx,
            state,
            workers,
        })
    }
}

// ── WorkerPool ──────────────────────────────────────────────────────

/// Running workers plus the state channel that steers them.
pub struct WorkerPool {
    ctx: TaskContext,
    state: watch::Sender<PoolState>,
    workers: JoinSet<Result<WorkerSummary>>,
}

impl WorkerPool {
    pub fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PoolState> {
        self.state.subscribe()
    }

    /// Broadcast a new state to all workers.
    pub fn set_state(&self, state: PoolState) {
        self.state.send_replace(state);
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.ctx.queue
    }

    pub fn perf(&self) -> &Arc<PerformanceLog> {
        &self.ctx.perf
    }

    /// Workers that have not exited yet.
    pub fn running(&self) -> usize {
        self.workers.len()
    }

    /// Wait for the next worker to exit. `None` once all have.
    pub async fn next_exit(&mut self) -> Option<WorkerExit> {
        self.workers.join_next().await
    }

    /// Cancel every worker at its next await point. In-flight subprocesses
    /// are killed when their handles drop.
    pub fn abort_all(&mut self) {
        self.workers.abort_all();
    }
}
