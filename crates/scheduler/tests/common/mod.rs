//! Shared fixtures for the scheduler integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use benchd_core::{BenchConfig, BuildPhase, TaskDescriptor};
use benchd_scheduler::error::Result;
use benchd_scheduler::{BenchmarkRunner, RunReport};

pub const WAIT: Duration = Duration::from_secs(10);

/// A throwaway queue, testbed and candidate area under one temp dir.
pub struct Bench {
    pub dir: tempfile::TempDir,
    pub config: BenchConfig,
}

impl Bench {
    pub fn new(workers: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let mut config = BenchConfig::default();
        config.queue.waiting_dir = root.join("tasks/waiting");
        config.queue.finished_dir = root.join("tasks/finished");
        config.queue.in_progress_dir = root.join("tasks/in-progress");
        config.queue.idle_interval_ms = 20;
        config.sandbox.testbed_dir = root.join("testbed");
        config.grounding.source_dir = root.join("source");
        config.pool.workers = workers;
        config.pool.force_timeout_ms = 500;
        config.perf.log_path = root.join("InternalBenchmark.log");

        std::fs::create_dir_all(&config.sandbox.testbed_dir).unwrap();
        std::fs::write(config.sandbox.testbed_dir.join("compile.sh"), "true\n").unwrap();
        std::fs::create_dir_all(&config.queue.waiting_dir).unwrap();
        Self { dir, config }
    }

    pub fn arc(&self) -> Arc<BenchConfig> {
        Arc::new(self.config.clone())
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn candidate(&self, name: &str) -> PathBuf {
        self.path("cands").join(name)
    }

    /// Create a candidate folder and drop `<name>.task` into the waiting queue.
    pub fn submit(&self, name: &str, phase: BuildPhase) -> PathBuf {
        let candidate = self.candidate(name);
        std::fs::create_dir_all(&candidate).unwrap();
        let path = self.config.queue.waiting_dir.join(format!("{name}.task"));
        std::fs::write(&path, TaskDescriptor::render(&candidate, phase)).unwrap();
        path
    }

    pub fn waiting(&self) -> Vec<String> {
        list(&self.config.queue.waiting_dir)
    }

    pub fn finished(&self) -> Vec<String> {
        list(&self.config.queue.finished_dir)
    }

    pub fn in_progress(&self) -> Vec<String> {
        list(&self.config.queue.in_progress_dir)
    }

    /// Poll until `n` task files have been archived.
    pub async fn wait_for_finished(&self, n: usize) -> bool {
        wait_until(WAIT, || self.finished().len() >= n).await
    }
}

pub fn list(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

// ── Runners ─────────────────────────────────────────────────────────

/// Records which tasks it ran and writes a fixed score.
pub struct RecordingRunner {
    phase: BuildPhase,
    pub seen: Mutex<Vec<String>>,
}

impl RecordingRunner {
    pub fn new(phase: BuildPhase) -> Arc<Self> {
        Arc::new(Self {
            phase,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<String> {
        let mut seen = self.seen.lock().unwrap().clone();
        seen.sort();
        seen
    }
}

#[async_trait]
impl BenchmarkRunner for RecordingRunner {
    fn name(&self) -> &str {
        "recording"
    }

    fn phase(&self) -> BuildPhase {
        self.phase
    }

    async fn run(&self, task: &TaskDescriptor, sandbox: &Path) -> Result<RunReport> {
        self.seen.lock().unwrap().push(task.id.clone());
        tokio::time::sleep(Duration::from_millis(5)).await;
        std::fs::write(sandbox.join("score"), "1").unwrap();
        Ok(RunReport {
            score: 1.0,
            steps: Vec::new(),
        })
    }
}

/// Signals when it starts, then waits for `release` (or forever).
pub struct GatedRunner {
    phase: BuildPhase,
    pub started: Notify,
    pub release: Notify,
}

impl GatedRunner {
    pub fn new(phase: BuildPhase) -> Arc<Self> {
        Arc::new(Self {
            phase,
            started: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl BenchmarkRunner for GatedRunner {
    fn name(&self) -> &str {
        "gated"
    }

    fn phase(&self) -> BuildPhase {
        self.phase
    }

    async fn run(&self, _task: &TaskDescriptor, sandbox: &Path) -> Result<RunReport> {
        self.started.notify_one();
        self.release.notified().await;
        std::fs::write(sandbox.join("score"), "0.5").unwrap();
        Ok(RunReport {
            score: 0.5,
            steps: Vec::new(),
        })
    }
}
