//! Process-wide log of named, timed intervals.
//!
//! Workers record one interval per task; the controller times the whole run
//! and appends a rendered summary to the log file at shutdown.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;

use crate::error::{Result, SchedulerError};

/// Interval name covering the pool's whole run.
pub const UPTIME: &str = "Uptime";
/// Interval name recorded once per processed task.
pub const TASK_INTERVAL: &str = "PerformBenchmarkForCandidate";

/// Aggregated timings for one interval name.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IntervalStats {
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
}

impl IntervalStats {
    fn first(duration: Duration) -> Self {
        Self {
            count: 1,
            total: duration,
            min: duration,
            max: duration,
            avg: duration,
        }
    }

    fn add(&mut self, duration: Duration) {
        self.count += 1;
        self.total += duration;
        self.min = self.min.min(duration);
        self.max = self.max.max(duration);

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let prev = self.avg.as_nanos() as f64;
        let cur = duration.as_nanos() as f64;
        self.avg = Duration::from_nanos((prev + (cur - prev) / self.count as f64) as u64);
    }
}

#[derive(Debug, Default)]
struct PerfState {
    open: HashMap<String, Instant>,
    intervals: BTreeMap<String, IntervalStats>,
    counters: BTreeMap<String, u64>,
}

/// Thread-safe performance log shared by all workers.
#[derive(Debug, Default)]
pub struct PerformanceLog {
    state: Mutex<PerfState>,
}

impl PerformanceLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PerfState> {
        // A panic while holding the lock cannot leave the maps inconsistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open an interval. Re-opening a name restarts it.
    pub fn log_start(&self, name: &str) {
        self.lock().open.insert(name.to_string(), Instant::now());
    }

    /// Close an interval opened with [`PerformanceLog::log_start`] and record
    /// it. Returns `None` if no interval with that name was open.
    pub fn log_end(&self, name: &str) -> Option<Duration> {
        let mut state = self.lock();
        let started = state.open.remove(name)?;
        let elapsed = started.elapsed();
        record_into(&mut state, name, elapsed);
        Some(elapsed)
    }

    /// Record an interval measured elsewhere.
    pub fn record(&self, name: &str, duration: Duration) {
        record_into(&mut self.lock(), name, duration);
    }

    /// Set a named counter, e.g. pool totals at shutdown.
    pub fn set_counter(&self, name: &str, value: u64) {
        self.lock().counters.insert(name.to_string(), value);
    }

    pub fn snapshot(&self) -> BTreeMap<String, IntervalStats> {
        self.lock().intervals.clone()
    }

    pub fn counters(&self) -> BTreeMap<String, u64> {
        self.lock().counters.clone()
    }

    /// Human-readable summary, one line per interval and counter.
    pub fn render(&self) -> String {
        let state = self.lock();
        let mut out = String::new();
        for (name, s) in &state.intervals {
            let _ = writeln!(
                out,
                "{name}: count={} total={:.3}s avg={:.3}s min={:.3}s max={:.3}s",
                s.count,
                s.total.as_secs_f64(),
                s.avg.as_secs_f64(),
                s.min.as_secs_f64(),
                s.max.as_secs_f64(),
            );
        }
        for (name, value) in &state.counters {
            let _ = writeln!(out, "{name}: {value}");
        }
        out
    }

    /// Append the rendered summary to `path` under a timestamp header.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(SchedulerError::io(parent))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(SchedulerError::io(path))?;
        let block = format!("=== {} ===\n{}\n", Utc::now().to_rfc3339(), self.render());
        file.write_all(block.as_bytes()).map_err(SchedulerError::io(path))
    }
}

fn record_into(state: &mut PerfState, name: &str, duration: Duration) {
    match state.intervals.get_mut(name) {
        Some(stats) => stats.add(duration),
        None => {
            state
                .intervals
                .insert(name.to_string(), IntervalStats::first(duration));
        }
    }
}
