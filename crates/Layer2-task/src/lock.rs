//! Per-entity async locks
//!
//! Entries are created on first use and shared through `Arc`, so a caller
//! can take an owned guard and hold it across awaits.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Lazily created lock per key (`L` is usually `tokio::sync::Mutex<()>` or `RwLock<()>`)
pub struct KeyedLocks<K, L> {
    entries: Mutex<HashMap<K, Arc<L>>>,
}

impl<K, L> KeyedLocks<K, L>
where
    K: Eq + Hash + Copy,
    L: Default,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The lock for `key`
    pub fn get(&self, key: K) -> Arc<L> {
        Arc::clone(self.entries.lock().entry(key).or_default())
    }

    pub fn remove(&self, key: &K) {
        self.entries.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, L> Default for KeyedLocks<K, L>
where
    K: Eq + Hash + Copy,
    L: Default,
{
    fn default() -> Self {
        Self::new()
    }
}
