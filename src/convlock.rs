//! Per-conversation mutual exclusion.
//!
//! History reads and writes for one conversation are serialised through a
//! per-key async mutex; different keys are independent. tokio mutexes queue
//! waiters fairly, so acquisitions for one key resolve in FIFO order, and the
//! returned owned guard releases on drop on every path, including errors.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Table of per-key conversation locks.
#[derive(Clone, Default)]
pub struct ConversationMutex {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ConversationMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting behind earlier acquirers.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_exclusion_within_key() {
        let locks = ConversationMutex::new();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("web:c1").await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1, "no two holders overlap");
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let locks = ConversationMutex::new();
        let _guard_a = locks.acquire("web:c1").await;
        // A different key must not block.
        let acquired = tokio::time::timeout(Duration::from_millis(100), locks.acquire("web:c2"))
            .await
            .is_ok();
        assert!(acquired);
    }

    #[tokio::test]
    async fn test_release_on_drop() {
        let locks = ConversationMutex::new();
        {
            let _guard = locks.acquire("web:c1").await;
        }
        let reacquired = tokio::time::timeout(Duration::from_millis(100), locks.acquire("web:c1"))
            .await
            .is_ok();
        assert!(reacquired);
    }

    #[tokio::test]
    async fn test_fifo_ordering() {
        let locks = ConversationMutex::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = locks.acquire("web:c1").await;
        let mut handles = Vec::new();
        for i in 0..4 {
            let locks = locks.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("web:c1").await;
                order.lock().await.push(i);
            }));
            // Give each waiter time to enqueue before the next.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3]);
    }
}
