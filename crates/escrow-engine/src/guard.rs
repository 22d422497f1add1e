use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bet_domain::BetId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-bet critical sections. Every guarded transition acquires the bet's lock
/// before reading status and holds it through the commit, so two tasks can
/// never interleave a read-decide-write cycle on the same bet.
#[derive(Debug, Default)]
pub struct BetLockRegistry {
    locks: Mutex<HashMap<BetId, Arc<AsyncMutex<()>>>>,
}

impl BetLockRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry mutex only guards the id-to-lock map and is never held
    /// across an await; a poisoned map still holds valid lock handles.
    pub async fn acquire(&self, bet_id: BetId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(bet_id).or_default())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn same_bet_sections_are_mutually_exclusive() {
        let registry = Arc::new(BetLockRegistry::new());
        let bet_id = BetId::new();
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let in_section = Arc::clone(&in_section);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = registry.acquire(bet_id).await;
                let current = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(current, Ordering::SeqCst);
                tokio::task::yield_now().await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.expect("task");
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_bets_do_not_contend() {
        let registry = BetLockRegistry::new();
        let _a = registry.acquire(BetId::new()).await;
        let _b = registry.acquire(BetId::new()).await;
    }
}
