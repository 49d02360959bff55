//! Generalizes `Locker`'s one-permit-per-resource idiom into a registry
//! keyed by an arbitrary hashable key, so unrelated keys never contend with
//! each other. Used by `RepoPreparer` (keyed by `(ProjectId, shortSha)`) to
//! serialize concurrent working-tree preparation for the same commit.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;

pub struct KeyedLockRegistry<K> {
    locks: DashMap<K, Arc<Semaphore>>,
}

impl<K> Default for KeyedLockRegistry<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedLockRegistry<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Acquires the single permit for `key`, waiting for any in-flight
    /// holder to finish. The returned guard releases the permit on drop.
    pub async fn acquire(&self, key: K) -> KeyedLockGuard {
        let semaphore = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();

        // Semaphore::acquire_owned borrows the Arc for the guard's lifetime,
        // so the guard outlives this function without borrowing `self`.
        let permit = semaphore
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        KeyedLockGuard { _permit: permit }
    }
}

pub struct KeyedLockGuard {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_serializes_concurrent_acquirers() {
        let registry: Arc<KeyedLockRegistry<&'static str>> = Arc::new(KeyedLockRegistry::new());
        let concurrent = Arc::new(AtomicU32::new(0));
        let max_concurrent = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let registry = registry.clone();
            let concurrent = concurrent.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(tokio::spawn(async move {
                let _guard = registry.acquire("same-key").await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let registry: KeyedLockRegistry<i32> = KeyedLockRegistry::new();
        let g1 = registry.acquire(1).await;
        let g2 = tokio::time::timeout(Duration::from_millis(50), registry.acquire(2)).await;
        assert!(g2.is_ok());
        drop(g1);
    }
}
