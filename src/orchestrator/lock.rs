//! Process-local keyed mutex over conversation ids.
//!
//! Contending handlers queue FIFO (tokio mutexes wake waiters in order) and
//! the guard releases on any exit, normal or panic-unwind. Serialization is
//! in-process only; running several processes against one database voids it.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed mutex: at most one in-flight handler per conversation id.
#[derive(Default)]
pub struct ConversationLock {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ConversationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a conversation, queueing behind any holder.
    pub async fn acquire(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(conversation_id.to_string())
            .or_default()
            .clone();
        mutex.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_id_serializes() {
        let lock = Arc::new(ConversationLock::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = lock.acquire("conv-1").await;
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_ids_run_concurrently() {
        let lock = Arc::new(ConversationLock::new());
        let guard_a = lock.acquire("a").await;

        // A second id must not queue behind the first.
        let acquired_b = tokio::time::timeout(Duration::from_millis(100), lock.acquire("b")).await;
        assert!(acquired_b.is_ok());
        drop(guard_a);
    }

    #[tokio::test]
    async fn released_on_error_paths() {
        let lock = Arc::new(ConversationLock::new());
        {
            let _guard = lock.acquire("c").await;
            // guard dropped at scope end, as it would be on `?` propagation
        }
        let reacquired =
            tokio::time::timeout(Duration::from_millis(100), lock.acquire("c")).await;
        assert!(reacquired.is_ok());
    }
}
