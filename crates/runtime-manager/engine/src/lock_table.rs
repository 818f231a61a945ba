//! Per-key mutual exclusion.
//!
//! One async mutex per key, created on first use and dropped from the table
//! as soon as nobody holds or waits for it. Each entry counts its holders
//! plus queued waiters; the count is only ever raised while the entry's map
//! shard is locked, and an entry is only removed under the same shard lock
//! when the count is zero, so a removed entry can never be handed out again.

use dashmap::DashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

struct LockEntry {
    mutex: Arc<Mutex<()>>,
    refs: AtomicUsize,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            mutex: Arc::new(Mutex::new(())),
            refs: AtomicUsize::new(0),
        }
    }
}

type Entries<K> = Arc<DashMap<K, Arc<LockEntry>>>;

/// Table of per-key locks
pub struct LockTable<K>
where
    K: Eq + Hash + Clone,
{
    entries: Entries<K>,
}

impl<K> LockTable<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Wait until the lock for `key` is free and take it.
    ///
    /// Waiters on the same key are served in arrival order. Dropping the
    /// returned future while it waits gives up the place in the queue.
    pub async fn acquire(&self, key: K) -> LockGuard<K> {
        let mut guard = self.reserve(key);
        let mutex = Arc::clone(&guard.entry.mutex);
        guard.held = Some(mutex.lock_owned().await);
        guard
    }

    /// Like [`acquire`](Self::acquire), giving up after `timeout`
    pub async fn acquire_timeout(&self, key: K, timeout: Duration) -> Option<LockGuard<K>> {
        tokio::time::timeout(timeout, self.acquire(key)).await.ok()
    }

    /// Take the lock for `key` only if it is free right now
    pub fn try_acquire(&self, key: K) -> Option<LockGuard<K>> {
        let mut guard = self.reserve(key);
        let mutex = Arc::clone(&guard.entry.mutex);
        guard.held = Some(mutex.try_lock_owned().ok()?);
        Some(guard)
    }

    /// Number of keys currently held or waited for
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    fn reserve(&self, key: K) -> LockGuard<K> {
        let entry = {
            let slot = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(LockEntry::new()));
            slot.refs.fetch_add(1, Ordering::AcqRel);
            Arc::clone(slot.value())
        };
        LockGuard {
            key,
            entry,
            entries: Arc::clone(&self.entries),
            held: None,
        }
    }
}

impl<K> Default for LockTable<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for LockTable<K>
where
    K: Eq + Hash + Clone,
{
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

/// Exclusive hold on one key. Released on drop.
///
/// While `held` is `None` the guard only reserves a place in the queue; that
/// is the state a pending `acquire` future is in, so dropping the future
/// still settles the entry's count.
pub struct LockGuard<K>
where
    K: Eq + Hash + Clone,
{
    key: K,
    entry: Arc<LockEntry>,
    entries: Entries<K>,
    held: Option<OwnedMutexGuard<()>>,
}

impl<K> LockGuard<K>
where
    K: Eq + Hash + Clone,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for LockGuard<K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        // Unlock before giving up the reference so the next waiter can run
        self.held.take();

        if self.entry.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            let entry = &self.entry;
            self.entries.remove_if(&self.key, |_, current| {
                Arc::ptr_eq(current, entry) && current.refs.load(Ordering::Acquire) == 0
            });
        }
    }
}

impl<K> fmt::Debug for LockGuard<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("held", &self.held.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let table = LockTable::new();
        let guard = table.acquire("a").await;
        assert!(table.contains(&"a"));
        assert_eq!(table.len(), 1);

        drop(guard);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let table = LockTable::new();
        let guard = table.acquire(1u32).await;
        assert!(table.try_acquire(1).is_none());
        assert!(table.try_acquire(2).is_some());

        drop(guard);
        assert!(table.try_acquire(1).is_some());
        assert!(table.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waiter_gets_lock_after_release() {
        let table = LockTable::new();
        let first = table.acquire("k").await;
        let entered = Arc::new(AtomicBool::new(false));

        let waiter = {
            let table = table.clone();
            let entered = Arc::clone(&entered);
            tokio::spawn(async move {
                let _guard = table.acquire("k").await;
                entered.store(true, Ordering::SeqCst);
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!entered.load(Ordering::SeqCst));

        drop(first);
        waiter.await.unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_leaves_table_clean() {
        let table = LockTable::new();
        let held = table.acquire("busy").await;

        let waited = table
            .acquire_timeout("busy", Duration::from_millis(20))
            .await;
        assert!(waited.is_none());
        assert_eq!(table.len(), 1);

        drop(held);
        assert!(table.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_aborted_waiter_leaves_table_clean() {
        let table = LockTable::new();
        let held = table.acquire(7u64).await;

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move {
                let _guard = table.acquire(7).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        let _ = waiter.await;

        drop(held);
        assert!(table.is_empty());
    }

    proptest! {
        /// try_acquire succeeds exactly when the key is not held, and the
        /// table tracks exactly the held keys.
        #[test]
        fn table_tracks_held_keys(
            ops in prop::collection::vec((0u8..8, any::<bool>()), 1..64),
        ) {
            let table = LockTable::new();
            let mut held: HashMap<u8, LockGuard<u8>> = HashMap::new();

            for (key, release) in ops {
                if release {
                    held.remove(&key);
                } else {
                    let guard = table.try_acquire(key);
                    prop_assert_eq!(guard.is_some(), !held.contains_key(&key));
                    if let Some(guard) = guard {
                        held.insert(key, guard);
                    }
                }
                prop_assert_eq!(table.len(), held.len());
            }

            held.clear();
            prop_assert!(table.is_empty());
        }
    }
}
