//! In-memory record of claimed task files.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

/// Set of task-file names claimed during this process lifetime.
///
/// All claims across all workers go through one lock, so a name is handed
/// out at most once. Nothing is persisted: a restart forgets every claim.
#[derive(Debug, Default)]
pub struct DedupRegistry {
    claimed: Mutex<HashSet<String>>,
    /// Successful claims, including ones later released. Attempts rolled
    /// back inside [`DedupRegistry::claim_with`] are not counted.
    claims_total: AtomicU64,
}

impl DedupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` and run `create` inside the critical section.
    ///
    /// Returns `None` if the name was already claimed, or if `create` yields
    /// `Ok(None)` because the task cannot be taken yet. If `create` fails or
    /// declines, the entry is released again so a later scan can retry.
    pub async fn claim_with<T, E, F, Fut>(&self, name: &str, create: F) -> Option<Result<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let mut claimed = self.claimed.lock().await;
        if !claimed.insert(name.to_string()) {
            return None;
        }

        match create().await {
            Ok(Some(value)) => {
                self.claims_total.fetch_add(1, Ordering::Relaxed);
                Some(Ok(value))
            }
            Ok(None) => {
                claimed.remove(name);
                None
            }
            Err(e) => {
                claimed.remove(name);
                Some(Err(e))
            }
        }
    }

    /// Claim `name` without any work in the critical section.
    pub async fn try_claim(&self, name: &str) -> bool {
        let inserted = self.claimed.lock().await.insert(name.to_string());
        if inserted {
            self.claims_total.fetch_add(1, Ordering::Relaxed);
        }
        inserted
    }

    /// Forget a claim so the task can be picked up again.
    pub async fn release(&self, name: &str) {
        self.claimed.lock().await.remove(name);
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.claimed.lock().await.contains(name)
    }

    pub async fn len(&self) -> usize {
        self.claimed.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.claimed.lock().await.is_empty()
    }

    pub fn claims_total(&self) -> u64 {
        self.claims_total.load(Ordering::Relaxed)
    }
}
