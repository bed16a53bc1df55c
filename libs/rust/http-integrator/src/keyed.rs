//! Bounded map of per-endpoint state cells.
//!
//! Each key owns its own mutex, so unrelated endpoints never contend. When the
//! map grows past its capacity the least recently used idle cell is evicted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

struct Slot<T> {
    cell: Arc<Mutex<T>>,
    last_used: AtomicU64,
}

pub(crate) struct KeyedStore<T> {
    slots: DashMap<String, Slot<T>>,
    capacity: usize,
    tick: AtomicU64,
}

impl<T> KeyedStore<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: DashMap::new(),
            capacity: capacity.max(1),
            tick: AtomicU64::new(0),
        }
    }

    /// Run `f` inside the exclusive section for `key`, creating the cell on first use.
    ///
    /// `f` must not block; it runs with the key's mutex held.
    pub(crate) fn with<R>(
        &self,
        key: &str,
        init: impl FnOnce() -> T,
        f: impl FnOnce(&mut T) -> R,
    ) -> R {
        let cell = self.cell(key, init);
        let mut state = cell.lock();
        f(&mut state)
    }

    /// Read the state for `key` without creating it.
    pub(crate) fn peek<R>(&self, key: &str, f: impl FnOnce(&T) -> R) -> Option<R> {
        let cell = self.slots.get(key).map(|slot| Arc::clone(&slot.cell))?;
        let state = cell.lock();
        Some(f(&state))
    }

    /// Shared handle to the cell for `key`, creating it on first use.
    ///
    /// A cell with outstanding handles is never evicted.
    pub(crate) fn cell(&self, key: &str, init: impl FnOnce() -> T) -> Arc<Mutex<T>> {
        let now = self.tick.fetch_add(1, Ordering::Relaxed);

        if let Some(slot) = self.slots.get(key) {
            slot.last_used.store(now, Ordering::Relaxed);
            return Arc::clone(&slot.cell);
        }

        let cell = Arc::clone(
            &self
                .slots
                .entry(key.to_string())
                .or_insert_with(|| Slot {
                    cell: Arc::new(Mutex::new(init())),
                    last_used: AtomicU64::new(now),
                })
                .cell,
        );

        while self.slots.len() > self.capacity {
            if !self.evict_one(key) {
                break;
            }
        }
        cell
    }

    pub(crate) fn remove(&self, key: &str) {
        self.slots.remove(key);
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    fn evict_one(&self, keep: &str) -> bool {
        let victim = self
            .slots
            .iter()
            .filter(|entry| entry.key() != keep && Arc::strong_count(&entry.cell) == 1)
            .min_by_key(|entry| entry.last_used.load(Ordering::Relaxed))
            .map(|entry| entry.key().clone());

        victim.is_some_and(|key| {
            self.slots
                .remove_if(&key, |_, slot| Arc::strong_count(&slot.cell) == 1)
                .is_some()
        })
    }
}
