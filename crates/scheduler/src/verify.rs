//! External pass/fail check on a candidate's output folder.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use benchd_core::BenchConfig;
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs `<executable> <absolute folder>`; exit code 0 passes.
#[derive(Debug, Clone)]
pub struct VerificationCheck {
    executable: PathBuf,
}

impl VerificationCheck {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// `None` if no verification executable is configured.
    pub fn from_config(config: &BenchConfig) -> Option<Self> {
        config.verification.executable.clone().map(Self::new)
    }

    /// Check a candidate output folder. A launch failure counts as a fail.
    pub async fn check(&self, folder: &Path) -> bool {
        let folder = absolute(folder);
        debug!(
            executable = %self.executable.display(),
            folder = %folder.display(),
            "running verification"
        );

        let status = Command::new(&self.executable)
            .arg(&folder)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;

        match status {
            Ok(status) if status.success() => true,
            Ok(status) => {
                debug!(code = ?status.code(), folder = %folder.display(), "verification failed");
                false
            }
            Err(e) => {
                warn!(executable = %self.executable.display(), error = %e, "failed to launch verification");
                false
            }
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
