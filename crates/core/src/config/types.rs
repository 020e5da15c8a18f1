use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for the benchmark scheduler.
///
/// Parsed from `benchd.toml` with support for environment variable overrides.
/// Every section has defaults, so an empty file yields a usable local setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Waiting/finished queue directories and claim behaviour.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Testbed template and sandbox placement.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Source template and optional grounding executable.
    #[serde(default)]
    pub grounding: GroundingConfig,

    /// Build/train/test step execution.
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Which sandbox entries stay behind when results are copied back.
    #[serde(default)]
    pub publish: PublishConfig,

    /// Worker pool size and shutdown behaviour.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Global performance log.
    #[serde(default)]
    pub perf: PerfConfig,

    /// Candidate verification executable.
    #[serde(default)]
    pub verification: VerificationConfig,
}

// ── Section configs ─────────────────────────────────────────────────

/// How a worker claims a task file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimMode {
    /// In-memory registry; testbed copied inside the claim lock. Claims are
    /// forgotten on restart.
    #[default]
    Registry,
    /// Atomic rename into the in-progress directory; testbed copied outside
    /// the lock. Interrupted claims are recovered at startup.
    Rename,
}

/// What a worker does when listing the waiting directory fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanErrorPolicy {
    /// Log the error and rescan after the idle interval.
    #[default]
    Retry,
    /// Stop the worker and report the error (surfaces a misconfigured queue).
    FailFast,
}

/// Queue section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_waiting_dir")]
    pub waiting_dir: PathBuf,

    #[serde(default = "default_finished_dir")]
    pub finished_dir: PathBuf,

    /// Only used by [`ClaimMode::Rename`].
    #[serde(default = "default_in_progress_dir")]
    pub in_progress_dir: PathBuf,

    /// Task file extension, without the dot.
    #[serde(default = "default_extension")]
    pub extension: String,

    #[serde(default)]
    pub claim_mode: ClaimMode,

    /// Sleep between scans that claimed nothing.
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,

    #[serde(default)]
    pub scan_error_policy: ScanErrorPolicy,
}

fn default_waiting_dir() -> PathBuf {
    PathBuf::from("tasks/waiting")
}

fn default_finished_dir() -> PathBuf {
    PathBuf::from("tasks/finished")
}

fn default_in_progress_dir() -> PathBuf {
    PathBuf::from("tasks/in-progress")
}

fn default_extension() -> String {
    "task".into()
}

fn default_idle_interval_ms() -> u64 {
    1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            waiting_dir: default_waiting_dir(),
            finished_dir: default_finished_dir(),
            in_progress_dir: default_in_progress_dir(),
            extension: default_extension(),
            claim_mode: ClaimMode::default(),
            idle_interval_ms: default_idle_interval_ms(),
            scan_error_policy: ScanErrorPolicy::default(),
        }
    }
}

/// Sandbox section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Template directory copied for every task.
    #[serde(default = "default_testbed_dir")]
    pub testbed_dir: PathBuf,

    /// Where sandboxes are created. Defaults to the testbed's parent directory.
    pub root: Option<PathBuf>,
}

fn default_testbed_dir() -> PathBuf {
    PathBuf::from("testbed")
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            testbed_dir: default_testbed_dir(),
            root: None,
        }
    }
}

/// Grounding section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundingConfig {
    /// Shared source template consumed by grounding.
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,

    /// External grounding program, invoked as `<exe> <candidate> <source> <sandbox>`.
    /// When unset, the built-in copy grounding is used.
    pub executable: Option<PathBuf>,
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("source")
}

impl Default for GroundingConfig {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            executable: None,
        }
    }
}

/// Runner section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Upper bound for a single compile/train/test step.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Script extension including the dot. Defaults to `.bat` on Windows, `.sh` elsewhere.
    pub script_extension: Option<String>,

    /// Pre-serialized validation instances required by classifier definitions.
    #[serde(default = "default_validation_file")]
    pub validation_file: String,
}

fn default_step_timeout_secs() -> u64 {
    600
}

fn default_validation_file() -> String {
    "validationInstances.serialized".into()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout_secs(),
            script_extension: None,
            validation_file: default_validation_file(),
        }
    }
}

/// Publish section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Top-level sandbox entries never copied back to the candidate folder.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
}

fn default_exclude() -> Vec<String> {
    [
        "compile.sh",
        "compile.bat",
        "train.sh",
        "train.bat",
        "test.sh",
        "test.bat",
        "libs",
        "validationInstances.serialized",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            exclude: default_exclude(),
        }
    }
}

/// Pool section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of parallel workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long a forced shutdown waits for workers before giving up on them.
    #[serde(default = "default_force_timeout_ms")]
    pub force_timeout_ms: u64,

    /// Console line that triggers a forced shutdown.
    #[serde(default = "default_quit_token")]
    pub quit_token: String,
}

fn default_workers() -> usize {
    4
}

fn default_force_timeout_ms() -> u64 {
    2000
}

fn default_quit_token() -> String {
    "q".into()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            force_timeout_ms: default_force_timeout_ms(),
            quit_token: default_quit_token(),
        }
    }
}

/// Performance log section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfConfig {
    #[serde(default = "default_perf_log_path")]
    pub log_path: PathBuf,
}

fn default_perf_log_path() -> PathBuf {
    PathBuf::from("InternalBenchmark.log")
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            log_path: default_perf_log_path(),
        }
    }
}

/// Verification section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Program invoked as `<exe> <candidateOutputFolder>`; exit code 0 passes.
    pub executable: Option<PathBuf>,
}

// ── Derived values ──────────────────────────────────────────────────

impl BenchConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.queue.idle_interval_ms)
    }

    pub fn force_timeout(&self) -> Duration {
        Duration::from_millis(self.pool.force_timeout_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.runner.step_timeout_secs)
    }

    /// Script extension for the current platform unless configured explicitly.
    pub fn script_extension(&self) -> &str {
        match &self.runner.script_extension {
            Some(ext) => ext.as_str(),
            None if cfg!(windows) => ".bat",
            None => ".sh",
        }
    }

    /// Directory sandboxes are created in.
    pub fn sandbox_root(&self) -> PathBuf {
        match &self.sandbox.root {
            Some(root) => root.clone(),
            None => self
                .sandbox
                .testbed_dir
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    /// Deterministic sandbox path for a candidate: `<root>/<testbed>_<candidate>`.
    pub fn sandbox_path_for(&self, candidate_name: &str) -> PathBuf {
        let testbed_name = self
            .sandbox
            .testbed_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "testbed".to_string());
        self.sandbox_root()
            .join(format!("{testbed_name}_{candidate_name}"))
    }

    /// Whether a top-level sandbox entry stays behind on publish.
    pub fn is_excluded(&self, name: &str) -> bool {
        self.publish.exclude.iter().any(|e| e == name)
    }
}
