//! Per-task sandbox workspaces cloned from the shared testbed.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use benchd_core::BenchConfig;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Result, SchedulerError};

/// Creates and destroys sandbox directories.
///
/// A sandbox is a full copy of the testbed template named after the candidate
/// (`<root>/<testbed>_<candidate>`). It belongs to the worker that created it
/// until [`SandboxManager::destroy`] is called.
pub struct SandboxManager {
    config: Arc<BenchConfig>,
    created: AtomicU64,
    /// Sandboxes handed out and not yet destroyed.
    live: Mutex<HashSet<PathBuf>>,
}

impl SandboxManager {
    pub fn new(config: Arc<BenchConfig>) -> Self {
        Self {
            config,
            created: AtomicU64::new(0),
            live: Mutex::new(HashSet::new()),
        }
    }

    /// Copy the testbed into a fresh sandbox for `candidate_name`.
    ///
    /// Returns `Ok(None)` while another task still owns the sandbox of that
    /// name. A directory at the target path that no task owns is a leftover
    /// from an aborted run and is removed first.
    pub async fn create(&self, candidate_name: &str) -> Result<Option<PathBuf>> {
        let testbed = self.config.sandbox.testbed_dir.clone();
        let target = self.config.sandbox_path_for(candidate_name);
        if !self.reserve(&target) {
            debug!(sandbox = %target.display(), "sandbox in use");
            return Ok(None);
        }

        let dest = target.clone();
        let copied = tokio::task::spawn_blocking(move || -> Result<u64> {
            if dest.exists() {
                warn!(sandbox = %dest.display(), "removing stale sandbox");
                std::fs::remove_dir_all(&dest).map_err(SchedulerError::io(&dest))?;
            }
            let copied = copy_dir_all(&testbed, &dest);
            if copied.is_err() {
                // Partial copies would be mistaken for a stale sandbox next time.
                if let Err(e) = std::fs::remove_dir_all(&dest) {
                    warn!(sandbox = %dest.display(), error = %e, "failed to remove partial sandbox");
                }
            }
            copied.map_err(SchedulerError::io(&testbed))
        })
        .await
        .map_err(SchedulerError::from)
        .and_then(|copied| copied);

        let copied = match copied {
            Ok(n) => n,
            Err(e) => {
                self.unreserve(&target);
                return Err(e);
            }
        };

        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(sandbox = %target.display(), files = copied, "sandbox created");
        Ok(Some(target))
    }

    /// Remove a sandbox and hand its name back. A sandbox that is already
    /// gone is not an error.
    pub async fn destroy(&self, sandbox: &Path) -> Result<()> {
        let removed = self.remove(sandbox).await;
        self.unreserve(sandbox);
        removed
    }

    /// Whether a task currently owns `sandbox`.
    pub fn is_live(&self, sandbox: &Path) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(sandbox)
    }

    fn reserve(&self, sandbox: &Path) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sandbox.to_path_buf())
    }

    fn unreserve(&self, sandbox: &Path) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(sandbox);
    }

    async fn remove(&self, sandbox: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(sandbox).await {
            Ok(()) => {
                debug!(sandbox = %sandbox.display(), "sandbox removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SchedulerError::io(sandbox)(e)),
        }
    }

    /// Number of sandboxes created so far.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }
}

/// Recursively copy `src` into `dst`, creating `dst`. Returns the number of
/// files copied.
pub fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<u64> {
    copy_dir_except(src, dst, &[])
}

/// Like [`copy_dir_all`], but top-level entries of `src` named in `skip` are
/// left out.
pub fn copy_dir_except(src: &Path, dst: &Path, skip: &[&str]) -> io::Result<u64> {
    std::fs::create_dir_all(dst)?;
    let mut files = 0;
    let walker = WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.depth() != 1 || !skip.iter().any(|s| e.file_name() == *s));
    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            files += 1;
        }
    }
    Ok(files)
}

/// Copy a file or directory to `dst`, replacing whatever is there.
pub fn replace_entry(src: &Path, dst: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(dst) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(dst)?,
        Ok(_) => std::fs::remove_file(dst)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if src.is_dir() {
        copy_dir_all(src, dst)?;
    } else {
        std::fs::copy(src, dst)?;
    }
    Ok(())
}
