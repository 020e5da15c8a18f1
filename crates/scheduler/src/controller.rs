//! Operator-facing supervision of a running pool: console quit token,
//! shutdown signals and the two shutdown paths.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use benchd_core::BenchConfig;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, error, info, warn};

use crate::perf::UPTIME;
use crate::pool::{PoolState, WorkerExit, WorkerPool};
use crate::worker::WorkerSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// In-flight tasks were allowed to finish.
    Graceful,
    /// Workers were interrupted.
    Forced,
}

#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub kind: ShutdownKind,
    /// Summaries of workers that exited on their own.
    pub summaries: Vec<WorkerSummary>,
    /// Workers cancelled before they could return a summary.
    pub abandoned: usize,
    /// Forced shutdown gave up waiting on at least one worker.
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn completed(&self) -> u64 {
        self.summaries.iter().map(|s| s.completed).sum()
    }

    pub fn failed(&self) -> u64 {
        self.summaries.iter().map(|s| s.failed).sum()
    }
}

/// Owns the pool from start to stop.
pub struct Controller {
    pool: WorkerPool,
    config: Arc<BenchConfig>,
    started: Instant,
    summaries: Vec<WorkerSummary>,
    abandoned: usize,
}

impl Controller {
    pub fn new(pool: WorkerPool, config: Arc<BenchConfig>) -> Self {
        Self {
            pool,
            config,
            started: Instant::now(),
            summaries: Vec::new(),
            abandoned: 0,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Watch the console and `signal` until something ends the run.
    ///
    /// A console line equal to the quit token forces a shutdown; other lines
    /// are ignored. `signal` completing drains the pool gracefully. If every
    /// worker exits by itself the run ends as well.
    pub async fn supervise<R, S>(mut self, console: R, signal: S) -> ShutdownReport
    where
        R: AsyncBufRead + Unpin,
        S: Future<Output = ()>,
    {
        let mut lines = console.lines();
        let mut console_open = true;
        tokio::pin!(signal);

        loop {
            tokio::select! {
                line = lines.next_line(), if console_open => match line {
                    Ok(Some(line)) if line.trim() == self.config.pool.quit_token => {
                        info!("quit requested from console");
                        return self.shutdown_forced().await;
                    }
                    Ok(Some(line)) => debug!(line = %line.trim(), "ignoring console input"),
                    Ok(None) => {
                        debug!("console closed");
                        console_open = false;
                    }
                    Err(e) => {
                        warn!(error = %e, "console read failed, no longer reading input");
                        console_open = false;
                    }
                },
                _ = &mut signal => {
                    info!("shutdown signal received, draining");
                    return self.shutdown_graceful().await;
                }
                exit = self.pool.next_exit() => match exit {
                    Some(exit) => self.collect(exit),
                    None => {
                        warn!("all workers exited");
                        return self.finish(ShutdownKind::Graceful, false);
                    }
                },
            }
        }
    }

    /// Stop claiming and wait for every in-flight task to finish.
    pub async fn shutdown_graceful(mut self) -> ShutdownReport {
        self.pool.set_state(PoolState::DrainRequested);
        info!(workers = self.pool.running(), "waiting for in-flight tasks");
        while let Some(exit) = self.pool.next_exit().await {
            self.collect(exit);
        }
        self.finish(ShutdownKind::Graceful, false)
    }

    /// Interrupt all workers and wait at most the configured force timeout.
    /// Sandboxes of interrupted tasks are left behind.
    pub async fn shutdown_forced(mut self) -> ShutdownReport {
        self.pool.set_state(PoolState::ForceStopRequested);
        self.pool.abort_all();

        let timeout = self.config.force_timeout();
        let waited = tokio::time::timeout(timeout, async {
            while let Some(exit) = self.pool.next_exit().await {
                self.collect(exit);
            }
        })
        .await;

        let timed_out = waited.is_err();
        if timed_out {
            warn!(
                timeout = ?timeout,
                remaining = self.pool.running(),
                "workers did not stop in time"
            );
        }
        self.finish(ShutdownKind::Forced, timed_out)
    }

    fn collect(&mut self, exit: WorkerExit) {
        match exit {
            Ok(Ok(summary)) => self.summaries.push(summary),
            Ok(Err(e)) => error!(error = %e, "worker stopped with error"),
            Err(e) if e.is_cancelled() => self.abandoned += 1,
            Err(e) => error!(error = %e, "worker panicked"),
        }
    }

    fn finish(self, kind: ShutdownKind, timed_out: bool) -> ShutdownReport {
        self.pool.set_state(PoolState::Stopped);

        let perf = self.pool.perf();
        perf.log_end(UPTIME);
        let total = self
            .summaries
            .iter()
            .fold(WorkerSummary::default(), |mut acc, s| {
                acc.claimed += s.claimed;
                acc.completed += s.completed;
                acc.failed += s.failed;
                acc.rejected += s.rejected;
                acc
            });
        perf.set_counter("TasksClaimed", total.claimed);
        perf.set_counter("TasksCompleted", total.completed);
        perf.set_counter("TasksFailed", total.failed);
        perf.set_counter("TasksRejected", total.rejected);

        let log_path = &self.config.perf.log_path;
        match perf.save_to_file(log_path) {
            Ok(()) => debug!(path = %log_path.display(), "performance log saved"),
            Err(e) => warn!(error = %e, "failed to save performance log"),
        }

        let elapsed = self.started.elapsed();
        info!(
            kind = ?kind,
            claimed = total.claimed,
            completed = total.completed,
            failed = total.failed,
            abandoned = self.abandoned,
            elapsed_s = elapsed.as_secs_f64(),
            "scheduler stopped"
        );

        ShutdownReport {
            kind,
            summaries: self.summaries,
            abandoned: self.abandoned,
            timed_out,
            elapsed,
        }
    }
}
