//! Integration tests for task discovery, claiming and dispatch across a
//! running worker pool.

mod common;

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use benchd_core::{BuildPhase, ClaimMode, TaskDescriptor};
use benchd_scheduler::error::Result;
use benchd_scheduler::{BenchmarkRunner, Controller, RunReport, ShutdownKind, WorkerPoolBuilder};

use common::{Bench, RecordingRunner};

#[tokio::test]
async fn every_task_processed_exactly_once() {
    let bench = Bench::new(4);
    let fe = RecordingRunner::new(BuildPhase::FeatureExtraction);
    let cd = RecordingRunner::new(BuildPhase::ClassifierDefinition);

    let mut expected = Vec::new();
    for i in 0..20 {
        let name = format!("cand{i:02}");
        let phase = if i % 2 == 0 {
            BuildPhase::FeatureExtraction
        } else {
            BuildPhase::ClassifierDefinition
        };
        bench.submit(&name, phase);
        expected.push(name);
    }

    let config = bench.arc();
    let pool = WorkerPoolBuilder::new(config.clone())
        .runner(fe.clone())
        .runner(cd.clone())
        .start()
        .unwrap();
    let queue = pool.queue().clone();

    assert!(bench.wait_for_finished(20).await, "tasks not archived in time");
    let report = Controller::new(pool, config).shutdown_graceful().await;

    assert_eq!(report.kind, ShutdownKind::Graceful);
    assert_eq!(report.completed(), 20);
    assert_eq!(report.failed(), 0);
    assert!(bench.waiting().is_empty());
    assert_eq!(bench.finished().len(), 20);
    assert_eq!(queue.sandboxes().created(), 20);

    let mut seen = fe.seen();
    seen.extend(cd.seen());
    seen.sort();
    let unique: HashSet<_> = seen.iter().collect();
    assert_eq!(unique.len(), seen.len(), "a task ran twice");
    assert_eq!(seen, expected);

    for name in &expected {
        let score = std::fs::read_to_string(bench.candidate(name).join("score")).unwrap();
        assert_eq!(score, "1");
    }
    let perf = std::fs::read_to_string(&bench.config.perf.log_path).unwrap();
    assert!(perf.contains("PerformBenchmarkForCandidate: count=20"));
    assert!(perf.contains("TasksCompleted: 20"));
}

#[tokio::test]
async fn phases_dispatch_to_their_own_runner() {
    let bench = Bench::new(2);
    let fe = RecordingRunner::new(BuildPhase::FeatureExtraction);
    let cd = RecordingRunner::new(BuildPhase::ClassifierDefinition);
    for name in ["fe1", "fe2", "fe3"] {
        bench.submit(name, BuildPhase::FeatureExtraction);
    }
    for name in ["cd1", "cd2"] {
        bench.submit(name, BuildPhase::ClassifierDefinition);
    }

    let config = bench.arc();
    let pool = WorkerPoolBuilder::new(config.clone())
        .runner(fe.clone())
        .runner(cd.clone())
        .start()
        .unwrap();
    assert!(bench.wait_for_finished(5).await);
    Controller::new(pool, config).shutdown_graceful().await;

    assert_eq!(fe.seen(), vec!["fe1", "fe2", "fe3"]);
    assert_eq!(cd.seen(), vec!["cd1", "cd2"]);
}

#[tokio::test]
async fn idle_workers_respect_scan_interval() {
    let mut bench = Bench::new(1);
    bench.config.queue.idle_interval_ms = 100;
    let config = bench.arc();

    let pool = WorkerPoolBuilder::new(config.clone()).start().unwrap();
    let queue = pool.queue().clone();
    tokio::time::sleep(Duration::from_millis(550)).await;
    let scans = queue.scan_count();
    Controller::new(pool, config).shutdown_graceful().await;

    assert!(scans >= 2, "worker stopped scanning ({scans} scans)");
    assert!(scans <= 7, "idle worker scanned {scans} times in 550ms");
}

#[tokio::test]
async fn rename_mode_processes_and_recovers_tasks() {
    let mut bench = Bench::new(3);
    bench.config.queue.claim_mode = ClaimMode::Rename;
    let fe = RecordingRunner::new(BuildPhase::FeatureExtraction);

    for i in 0..5 {
        bench.submit(&format!("r{i}"), BuildPhase::FeatureExtraction);
    }
    // Left behind by a crashed run.
    let stranded = bench.submit("stranded", BuildPhase::FeatureExtraction);
    std::fs::create_dir_all(&bench.config.queue.in_progress_dir).unwrap();
    std::fs::rename(
        &stranded,
        bench.config.queue.in_progress_dir.join("stranded.task"),
    )
    .unwrap();

    let config = bench.arc();
    let pool = WorkerPoolBuilder::new(config.clone())
        .runner(fe.clone())
        .start()
        .unwrap();
    assert!(bench.wait_for_finished(6).await);
    let report = Controller::new(pool, config).shutdown_graceful().await;

    assert_eq!(report.completed(), 6);
    assert!(bench.waiting().is_empty());
    assert!(bench.in_progress().is_empty());
    assert_eq!(fe.seen().len(), 6);
    assert!(fe.seen().contains(&"stranded".to_string()));
}

#[tokio::test]
async fn malformed_and_failing_tasks_are_still_archived() {
    let bench = Bench::new(2);
    let fe = RecordingRunner::new(BuildPhase::FeatureExtraction);
    bench.submit("good", BuildPhase::FeatureExtraction);
    std::fs::write(bench.config.queue.waiting_dir.join("garbage.task"), "not json").unwrap();
    // Candidate folder missing: copy grounding fails.
    let orphan = bench.submit("orphan", BuildPhase::FeatureExtraction);
    std::fs::remove_dir_all(bench.candidate("orphan")).unwrap();
    assert!(orphan.exists());

    let config = bench.arc();
    let pool = WorkerPoolBuilder::new(config.clone())
        .runner(fe.clone())
        .start()
        .unwrap();
    assert!(bench.wait_for_finished(3).await);
    let report = Controller::new(pool, config).shutdown_graceful().await;

    assert_eq!(report.completed(), 1);
    assert_eq!(report.failed(), 1);
    assert_eq!(bench.finished(), vec!["garbage.task", "good.task", "orphan.task"]);
    assert_eq!(fe.seen(), vec!["good"]);

    let record: serde_json::Value = serde_json::from_slice(
        &std::fs::read(bench.candidate("orphan").join("benchmark.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(record["status"], "failed");
    assert_eq!(record["score"], 0.0);
}

/// Marks the sandbox as its own, lingers, then checks nobody else touched it.
struct OwnershipRunner {
    trampled: AtomicUsize,
}

#[async_trait]
impl BenchmarkRunner for OwnershipRunner {
    fn name(&self) -> &str {
        "ownership"
    }

    fn phase(&self) -> BuildPhase {
        BuildPhase::FeatureExtraction
    }

    async fn run(&self, task: &TaskDescriptor, sandbox: &Path) -> Result<RunReport> {
        let marker = sandbox.join("owner");
        assert!(!marker.exists(), "sandbox handed out while in use");
        std::fs::write(&marker, &task.id).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        if std::fs::read_to_string(&marker).ok().as_deref() != Some(task.id.as_str()) {
            self.trampled.fetch_add(1, Ordering::SeqCst);
        }
        // Published with the results otherwise, and grounded into the next run.
        std::fs::remove_file(&marker).unwrap();
        std::fs::write(sandbox.join("score"), "1").unwrap();
        Ok(RunReport {
            score: 1.0,
            steps: Vec::new(),
        })
    }
}

#[tokio::test]
async fn tasks_for_one_candidate_never_share_a_sandbox() {
    let bench = Bench::new(4);
    let candidate = bench.candidate("shared");
    std::fs::create_dir_all(&candidate).unwrap();
    for i in 0..4 {
        std::fs::write(
            bench.config.queue.waiting_dir.join(format!("shared{i}.task")),
            TaskDescriptor::render(&candidate, BuildPhase::FeatureExtraction),
        )
        .unwrap();
    }

    let runner = Arc::new(OwnershipRunner {
        trampled: AtomicUsize::new(0),
    });
    let config = bench.arc();
    let pool = WorkerPoolBuilder::new(config.clone())
        .runner(runner.clone())
        .start()
        .unwrap();
    assert!(bench.wait_for_finished(4).await);
    let report = Controller::new(pool, config).shutdown_graceful().await;

    assert_eq!(report.completed(), 4);
    assert_eq!(report.failed(), 0);
    assert_eq!(runner.trampled.load(Ordering::SeqCst), 0);
}

struct PanickingRunner;

#[async_trait]
impl BenchmarkRunner for PanickingRunner {
    fn name(&self) -> &str {
        "panicking"
    }

    fn phase(&self) -> BuildPhase {
        BuildPhase::FeatureExtraction
    }

    async fn run(&self, _task: &TaskDescriptor, _sandbox: &Path) -> Result<RunReport> {
        panic!("runner blew up");
    }
}

#[tokio::test]
async fn panicking_runner_does_not_kill_the_worker() {
    let bench = Bench::new(1);
    bench.submit("p1", BuildPhase::FeatureExtraction);
    bench.submit("p2", BuildPhase::FeatureExtraction);

    let config = bench.arc();
    let pool = WorkerPoolBuilder::new(config.clone())
        .runner(Arc::new(PanickingRunner))
        .start()
        .unwrap();
    assert!(bench.wait_for_finished(2).await, "tasks not archived");
    let report = Controller::new(pool, config.clone()).shutdown_graceful().await;

    assert_eq!(report.summaries.len(), 1);
    assert_eq!(report.failed(), 2);
    assert_eq!(bench.finished(), vec!["p1.task", "p2.task"]);
    assert!(bench.waiting().is_empty());
    assert!(!config.sandbox_path_for("p1").exists());
    assert!(!config.sandbox_path_for("p2").exists());
}
