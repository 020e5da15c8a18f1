use std::env;
use std::path::{Path, PathBuf};

use crate::error::{BenchError, Result};

use super::types::{BenchConfig, ClaimMode, ScanErrorPolicy};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

impl BenchConfig {
    /// Parse config from a TOML string. Relative paths are left as written
    /// (resolved against the working directory).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides()?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path. Relative paths inside the file are
    /// resolved against the file's directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content)?;
        if let Some(base) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            config.resolve_relative_to(base);
        }
        config.apply_env_overrides()?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Build config from defaults plus environment overrides only.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        join(&mut self.queue.waiting_dir);
        join(&mut self.queue.finished_dir);
        join(&mut self.queue.in_progress_dir);
        join(&mut self.sandbox.testbed_dir);
        join(&mut self.grounding.source_dir);
        join(&mut self.perf.log_path);
        for opt in [
            &mut self.sandbox.root,
            &mut self.grounding.executable,
            &mut self.verification.executable,
        ] {
            if let Some(p) = opt.as_mut() {
                join(p);
            }
        }
    }

    fn normalize(&mut self) {
        let ext = self.queue.extension.trim().trim_start_matches('.');
        self.queue.extension = ext.to_string();
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `BENCHD_SECTION_KEY` overrides `section.key`.
    /// Examples:
    /// - `BENCHD_QUEUE_WAITING_DIR` -> `queue.waiting_dir`
    /// - `BENCHD_QUEUE_CLAIM_MODE` -> `queue.claim_mode` (`registry` | `rename`)
    /// - `BENCHD_SANDBOX_TESTBED_DIR` -> `sandbox.testbed_dir`
    /// - `BENCHD_POOL_WORKERS` -> `pool.workers`
    pub(crate) fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_opt("BENCHD_QUEUE_WAITING_DIR") {
            self.queue.waiting_dir = v.into();
        }
        if let Some(v) = env_opt("BENCHD_QUEUE_FINISHED_DIR") {
            self.queue.finished_dir = v.into();
        }
        if let Some(v) = env_opt("BENCHD_QUEUE_IN_PROGRESS_DIR") {
            self.queue.in_progress_dir = v.into();
        }
        if let Some(v) = env_opt("BENCHD_QUEUE_CLAIM_MODE") {
            self.queue.claim_mode = match v.to_lowercase().as_str() {
                "registry" => ClaimMode::Registry,
                "rename" => ClaimMode::Rename,
                other => {
                    return Err(BenchError::Config(format!(
                        "invalid BENCHD_QUEUE_CLAIM_MODE '{other}', expected 'registry' or 'rename'"
                    )))
                }
            };
        }
        if let Some(v) = env_opt("BENCHD_QUEUE_SCAN_ERROR_POLICY") {
            self.queue.scan_error_policy = match v.to_lowercase().as_str() {
                "retry" => ScanErrorPolicy::Retry,
                "fail_fast" => ScanErrorPolicy::FailFast,
                other => {
                    return Err(BenchError::Config(format!(
                        "invalid BENCHD_QUEUE_SCAN_ERROR_POLICY '{other}', expected 'retry' or 'fail_fast'"
                    )))
                }
            };
        }
        if let Some(v) = env_opt("BENCHD_SANDBOX_TESTBED_DIR") {
            self.sandbox.testbed_dir = v.into();
        }
        if let Some(v) = env_opt("BENCHD_SANDBOX_ROOT") {
            self.sandbox.root = Some(v.into());
        }
        if let Some(v) = env_opt("BENCHD_GROUNDING_SOURCE_DIR") {
            self.grounding.source_dir = v.into();
        }
        if let Some(v) = env_opt("BENCHD_GROUNDING_EXECUTABLE") {
            self.grounding.executable = Some(v.into());
        }
        if let Some(v) = env_opt("BENCHD_POOL_WORKERS") {
            if let Ok(n) = v.parse::<usize>() {
                self.pool.workers = n;
            }
        }
        if let Some(v) = env_opt("BENCHD_PERF_LOG_PATH") {
            self.perf.log_path = v.into();
        }
        if let Some(v) = env_opt("BENCHD_VERIFICATION_EXECUTABLE") {
            self.verification.executable = Some(v.into());
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!(
            "  queue:     waiting={}, finished={}, claim_mode={:?}",
            self.queue.waiting_dir.display(),
            self.queue.finished_dir.display(),
            self.queue.claim_mode
        );
        tracing::info!(
            "  sandbox:   testbed={}, root={}",
            self.sandbox.testbed_dir.display(),
            self.sandbox_root().display()
        );
        tracing::info!(
            "  grounding: source={}, executable={}",
            self.grounding.source_dir.display(),
            self.grounding
                .executable
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(built-in copy)".into())
        );
        tracing::info!("  pool:      workers={}", self.pool.workers);
        tracing::info!("  perf:      log={}", self.perf.log_path.display());
    }
}
