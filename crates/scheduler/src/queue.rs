//! Filesystem task queue: scanning, claiming and archiving task files.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use benchd_core::{BenchConfig, BenchError, BuildPhase, ClaimMode, TaskDescriptor};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::registry::DedupRegistry;
use crate::sandbox::SandboxManager;

/// A task this worker now owns, together with its sandbox.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub descriptor: TaskDescriptor,
    /// Current location of the task file (waiting or in-progress directory).
    pub task_path: PathBuf,
    pub sandbox: PathBuf,
    pub claimed_at: DateTime<Utc>,
}

/// Result of a successful claim.
#[derive(Debug)]
pub enum Claim {
    /// Ready for grounding and execution.
    Claimed(ClaimedTask),
    /// The task file could not be parsed. It stays claimed and should be
    /// archived without running.
    Rejected { task_path: PathBuf, error: BenchError },
}

/// The waiting/finished queue directories plus the claim protocol.
pub struct TaskQueue {
    config: Arc<BenchConfig>,
    registry: Arc<DedupRegistry>,
    sandboxes: SandboxManager,
    scans: AtomicU64,
}

impl TaskQueue {
    pub fn new(config: Arc<BenchConfig>, registry: Arc<DedupRegistry>) -> Self {
        Self {
            sandboxes: SandboxManager::new(config.clone()),
            config,
            registry,
            scans: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<DedupRegistry> {
        &self.registry
    }

    pub fn sandboxes(&self) -> &SandboxManager {
        &self.sandboxes
    }

    /// Number of directory scans performed so far.
    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    /// Create the queue directories if they do not exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        let q = &self.config.queue;
        let mut dirs = vec![&q.waiting_dir, &q.finished_dir];
        if q.claim_mode == ClaimMode::Rename {
            dirs.push(&q.in_progress_dir);
        }
        for dir in dirs {
            std::fs::create_dir_all(dir).map_err(SchedulerError::io(dir))?;
        }
        Ok(())
    }

    /// List task files in the waiting directory: regular files with the task
    /// extension, in whatever order the filesystem returns them.
    pub async fn scan(&self) -> Result<Vec<PathBuf>> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        let waiting = self.config.queue.waiting_dir.clone();
        let extension = self.config.queue.extension.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
            let mut tasks = Vec::new();
            for entry in std::fs::read_dir(&waiting).map_err(SchedulerError::io(&waiting))? {
                let entry = entry.map_err(SchedulerError::io(&waiting))?;
                let path = entry.path();
                let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
                let has_ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e == extension)
                    .unwrap_or(false);
                if is_file && has_ext {
                    tasks.push(path);
                }
            }
            Ok(tasks)
        })
        .await?
    }

    /// Try to claim a task file found by [`TaskQueue::scan`].
    ///
    /// `Ok(None)` means another worker already owns it, or the candidate's
    /// sandbox is still in use by another task and a later scan should retry. An `Err` means the
    /// claim was rolled back and a later scan may retry.
    pub async fn claim(&self, path: &Path) -> Result<Option<Claim>> {
        match self.config.queue.claim_mode {
            ClaimMode::Registry => self.claim_in_registry(path).await,
            ClaimMode::Rename => self.claim_by_rename(path).await,
        }
    }

    /// Registry check, descriptor parse and testbed copy all happen inside
    /// the registry lock.
    async fn claim_in_registry(&self, path: &Path) -> Result<Option<Claim>> {
        let name = file_name(path)?;
        let claimed = self
            .registry
            .claim_with(&name, || self.prepare_claim(path))
            .await;

        match claimed {
            None => Ok(None),
            Some(Ok(claim)) => Ok(Some(claim)),
            Some(Err(e)) => Err(e),
        }
    }

    async fn prepare_claim(&self, path: &Path) -> Result<Option<Claim>> {
        let descriptor = match read_descriptor(path, path).await? {
            Ok(d) => d,
            Err(error) => {
                return Ok(Some(Claim::Rejected {
                    task_path: path.to_path_buf(),
                    error,
                }))
            }
        };
        let Some(sandbox) = self.sandboxes.create(&descriptor.candidate_name()).await? else {
            debug!(task = %descriptor.id, "sandbox busy, leaving task queued");
            return Ok(None);
        };
        Ok(Some(Claim::Claimed(ClaimedTask {
            descriptor,
            task_path: path.to_path_buf(),
            sandbox,
            claimed_at: Utc::now(),
        })))
    }

    /// The rename into the in-progress directory is the claim; the testbed
    /// copy runs after it, outside any lock.
    async fn claim_by_rename(&self, path: &Path) -> Result<Option<Claim>> {
        let name = file_name(path)?;
        if !self.registry.try_claim(&name).await {
            return Ok(None);
        }

        let claimed_path = self.config.queue.in_progress_dir.join(&name);
        match tokio::fs::rename(path, &claimed_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Claimed by another process sharing the queue.
                debug!(task = %name, "task vanished before rename");
                self.registry.release(&name).await;
                return Ok(None);
            }
            Err(e) => {
                self.registry.release(&name).await;
                return Err(SchedulerError::io(path)(e));
            }
        }

        // Relative candidates resolve against where the producer wrote the file.
        let descriptor = match read_descriptor(&claimed_path, path).await {
            Ok(Ok(d)) => d,
            Ok(Err(error)) => {
                return Ok(Some(Claim::Rejected {
                    task_path: claimed_path,
                    error,
                }))
            }
            Err(e) => {
                self.unclaim(&name, &claimed_path, path).await;
                return Err(e);
            }
        };

        match self.sandboxes.create(&descriptor.candidate_name()).await {
            Ok(Some(sandbox)) => Ok(Some(Claim::Claimed(ClaimedTask {
                descriptor,
                task_path: claimed_path,
                sandbox,
                claimed_at: Utc::now(),
            }))),
            Ok(None) => {
                debug!(task = %descriptor.id, "sandbox busy, returning task to the queue");
                self.unclaim(&name, &claimed_path, path).await;
                Ok(None)
            }
            Err(e) => {
                self.unclaim(&name, &claimed_path, path).await;
                Err(e)
            }
        }
    }

    /// Undo a rename claim: move the file back and forget the name.
    async fn unclaim(&self, name: &str, claimed_path: &Path, original: &Path) {
        if let Err(e) = tokio::fs::rename(claimed_path, original).await {
            warn!(task = %name, error = %e, "failed to return task to waiting queue");
        }
        self.registry.release(name).await;
    }

    /// Move a task file into the finished directory.
    pub async fn archive(&self, task_path: &Path) -> Result<PathBuf> {
        let name = file_name(task_path)?;
        let target = self.config.queue.finished_dir.join(&name);

        if let Err(e) = tokio::fs::rename(task_path, &target).await {
            // Different filesystem: fall back to copy + remove.
            debug!(task = %name, error = %e, "rename failed, copying task file");
            tokio::fs::copy(task_path, &target)
                .await
                .map_err(SchedulerError::io(task_path))?;
            tokio::fs::remove_file(task_path)
                .await
                .map_err(SchedulerError::io(task_path))?;
        }
        Ok(target)
    }

    /// Move task files stranded in the in-progress directory by a crash back
    /// to the waiting directory. Only meaningful in rename mode.
    pub fn recover_in_progress(&self) -> Result<usize> {
        let q = &self.config.queue;
        if q.claim_mode != ClaimMode::Rename || !q.in_progress_dir.exists() {
            return Ok(0);
        }

        let mut recovered = 0;
        for entry in std::fs::read_dir(&q.in_progress_dir).map_err(SchedulerError::io(&q.in_progress_dir))? {
            let entry = entry.map_err(SchedulerError::io(&q.in_progress_dir))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let target = q.waiting_dir.join(entry.file_name());
            std::fs::rename(entry.path(), &target).map_err(SchedulerError::io(entry.path()))?;
            info!(task = %target.display(), "recovered interrupted task");
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Write a new task file into the waiting directory.
    ///
    /// The file is written under a temporary name first so a scanning worker
    /// never sees a half-written descriptor.
    pub fn submit(&self, candidate: &Path, phase: BuildPhase, name: Option<&str>) -> Result<PathBuf> {
        let stem = match name {
            Some(n) => n.to_string(),
            None => candidate
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    BenchError::Other(format!("cannot derive a task name from {}", candidate.display()))
                })?,
        };
        let waiting = &self.config.queue.waiting_dir;
        let target = waiting.join(format!("{stem}.{}", self.config.queue.extension));
        if target.exists() {
            return Err(BenchError::Other(format!("task {} already queued", target.display())).into());
        }

        let tmp = waiting.join(format!(".{stem}.tmp"));
        std::fs::write(&tmp, TaskDescriptor::render(candidate, phase)).map_err(SchedulerError::io(&tmp))?;
        std::fs::rename(&tmp, &target).map_err(SchedulerError::io(&target))?;
        info!(task = %target.display(), %phase, "task submitted");
        Ok(target)
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            BenchError::Descriptor {
                path: path.to_path_buf(),
                reason: "file name is not valid UTF-8".into(),
            }
            .into()
        })
}

/// Read the task file at `path`, resolving relative candidates as if it still
/// sat at `queued_at`. The outer error is an IO failure worth retrying; the
/// inner one is a malformed descriptor that will never parse.
async fn read_descriptor(
    path: &Path,
    queued_at: &Path,
) -> Result<std::result::Result<TaskDescriptor, BenchError>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(SchedulerError::io(path))?;
    let base = queued_at.parent().unwrap_or(Path::new(""));
    Ok(TaskDescriptor::parse_relative_to(path, base, &content))
}
