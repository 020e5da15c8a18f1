use crate::error::{BenchError, Result};

use super::types::{BenchConfig, ClaimMode};

/// Longest idle sleep accepted; keeps a drained pool responsive.
const MAX_IDLE_INTERVAL_MS: u64 = 60_000;

impl BenchConfig {
    /// Validate the config: pool size, queue layout, timeouts.
    pub fn validate(&self) -> Result<()> {
        self.validate_pool()?;
        self.validate_queue()?;
        self.validate_timeouts()?;
        Ok(())
    }

    fn validate_pool(&self) -> Result<()> {
        if self.pool.workers == 0 {
            return Err(BenchError::Config("pool.workers must be at least 1".into()));
        }
        if self.pool.quit_token.trim().is_empty() {
            return Err(BenchError::Config("pool.quit_token must not be empty".into()));
        }
        Ok(())
    }

    fn validate_queue(&self) -> Result<()> {
        let q = &self.queue;
        if q.extension.is_empty() {
            return Err(BenchError::Config("queue.extension must not be empty".into()));
        }
        if q.waiting_dir == q.finished_dir {
            return Err(BenchError::Config(format!(
                "queue.waiting_dir and queue.finished_dir must differ (both '{}')",
                q.waiting_dir.display()
            )));
        }
        if q.claim_mode == ClaimMode::Rename
            && (q.in_progress_dir == q.waiting_dir || q.in_progress_dir == q.finished_dir)
        {
            return Err(BenchError::Config(format!(
                "queue.in_progress_dir '{}' must differ from the waiting and finished directories",
                q.in_progress_dir.display()
            )));
        }
        if q.idle_interval_ms == 0 || q.idle_interval_ms > MAX_IDLE_INTERVAL_MS {
            return Err(BenchError::Config(format!(
                "queue.idle_interval_ms must be within 1..={MAX_IDLE_INTERVAL_MS}, got {}",
                q.idle_interval_ms
            )));
        }
        Ok(())
    }

    fn validate_timeouts(&self) -> Result<()> {
        if self.runner.step_timeout_secs == 0 {
            return Err(BenchError::Config("runner.step_timeout_secs must be positive".into()));
        }
        if self.pool.force_timeout_ms == 0 {
            return Err(BenchError::Config("pool.force_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}
