//! Per-key async mutual exclusion.
//!
//! One `tokio::sync::Mutex` per key, created on first use and dropped from
//! the map as soon as nobody holds or waits on it.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held while the owner works on `key`.
pub struct KeyedGuard<'a> {
    // field order matters: the mutex is released before the entry is checked
    _guard: OwnedMutexGuard<()>,
    _registration: Registration<'a>,
}

/// A holder's or waiter's claim on an entry. Dropping the last one evicts it,
/// including when a waiter is cancelled before it ever got the lock.
struct Registration<'a> {
    owner: &'a KeyedLocks,
    key: String,
    mutex: Option<Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no one else holds `key`, then hold it.
    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        // clone under the shard lock so eviction sees this waiter
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_default()
            .value()
            .clone();
        let registration = Registration {
            owner: self,
            key: key.to_string(),
            mutex: Some(mutex.clone()),
        };
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            _guard: guard,
            _registration: registration,
        }
    }

    /// Keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.mutex.take();
        // map's own reference is the only one left: uncontended
        self.owner
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let (locks, inside, max_seen) = (locks.clone(), inside.clone(), max_seen.clone());
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock("bucket/a.txt").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("bucket/a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("bucket/b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn entry_survives_while_someone_waits() {
        let locks = Arc::new(KeyedLocks::new());
        let first = locks.lock("k").await;

        let waiter_locks = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = waiter_locks.lock("k").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(first);
        assert!(locks.len() <= 1);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_its_entry() {
        let locks = KeyedLocks::new();
        let first = locks.lock("k").await;

        let mut waiter = Box::pin(locks.lock("k"));
        assert!(futures::poll!(waiter.as_mut()).is_pending());

        drop(first);
        assert_eq!(locks.len(), 1);
        drop(waiter);
        assert!(locks.is_empty());
    }
}
