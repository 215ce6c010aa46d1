use dashmap::DashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

/// Mutual exclusion keyed by entity id, so unrelated blocks or paths never wait on
/// each other.
pub struct KeyedLocks<K: Eq + Hash> {
    slots: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Runs `f` while holding the lock for `key`. Not reentrant for the same key.
    ///
    /// The slot for `key` is dropped once no caller holds or waits on it.
    pub fn with<R>(&self, key: &K, f: impl FnOnce() -> R) -> R {
        let slot = self.slots.entry(key.clone()).or_default().clone();
        let out = {
            let _guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f()
        };
        drop(slot);
        // Cloning a slot takes the same shard lock, so a count of one means nobody else
        // can still reach it.
        self.slots
            .remove_if(key, |_, slot| Arc::strong_count(slot) == 1);
        out
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}
