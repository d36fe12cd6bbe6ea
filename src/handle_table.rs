//! Handle table: stable 32-bit handles for long-lived resources.
//!
//! A non-native caller owns devices and forwarders through integer handles
//! rather than pointers. Handles are allocated lowest-free-first, are never
//! reused while the resource is live, and become invalid the moment the
//! entry is removed. Negative values never come out of the table; they are
//! reserved for error returns at the boundary.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;

/// The handle namespace is exhausted.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("handle table is full")]
pub struct HandleTableFull;

/// Thread-safe mapping from `i32` handle to resource.
///
/// `get` hands out clones so no borrow outlives a concurrent `remove`;
/// in practice `T` is an `Arc` around the real resource.
pub struct HandleTable<T: Clone> {
    entries: RwLock<HashMap<i32, T>>,
    capacity: usize,
}

impl<T: Clone> HandleTable<T> {
    pub fn new() -> Self {
        Self::with_capacity(i32::MAX as usize)
    }

    /// Bound the namespace to `capacity` simultaneous handles. Used by
    /// tests to exercise exhaustion without 2^31 insertions.
    pub fn with_capacity(capacity: usize) -> Self {
        HandleTable {
            entries: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Insert a resource and return its handle: the lowest non-negative
    /// value not currently in use. Linear probing is fine at the table
    /// sizes this crate sees (a handful of devices and forwarders).
    pub fn insert(&self, value: T) -> Result<i32, HandleTableFull> {
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            return Err(HandleTableFull);
        }
        let mut handle: i32 = 0;
        while entries.contains_key(&handle) {
            handle = handle.checked_add(1).ok_or(HandleTableFull)?;
        }
        entries.insert(handle, value);
        Ok(handle)
    }

    pub fn get(&self, handle: i32) -> Option<T> {
        self.entries.read().get(&handle).cloned()
    }

    /// Remove the entry and hand the resource back so the caller can
    /// dispose of it deterministically.
    pub fn remove(&self, handle: i32) -> Option<T> {
        self.entries.write().remove(&handle)
    }

    /// Visit every live entry. Iteration order is unspecified; the
    /// callback must not touch the table (it holds the read lock).
    pub fn for_each(&self, mut f: impl FnMut(i32, &T)) {
        for (handle, value) in self.entries.read().iter() {
            f(*handle, value);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<T: Clone> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn insert_get_remove() {
        let table = HandleTable::new();
        let h = table.insert("alpha").unwrap();
        assert_eq!(h, 0);
        assert_eq!(table.get(h), Some("alpha"));

        assert_eq!(table.remove(h), Some("alpha"));
        assert_eq!(table.get(h), None);
        assert_eq!(table.remove(h), None);
    }

    #[test]
    fn lowest_free_handle_is_reused_after_removal() {
        let table = HandleTable::new();
        let h0 = table.insert(0u8).unwrap();
        let h1 = table.insert(1u8).unwrap();
        let h2 = table.insert(2u8).unwrap();
        assert_eq!((h0, h1, h2), (0, 1, 2));

        table.remove(h1);
        assert_eq!(table.insert(9u8).unwrap(), 1);
        assert_eq!(table.insert(10u8).unwrap(), 3);
    }

    #[test]
    fn exhaustion_leaves_table_unchanged() {
        let table = HandleTable::with_capacity(2);
        let h0 = table.insert("a").unwrap();
        let h1 = table.insert("b").unwrap();
        assert_eq!(table.insert("c"), Err(HandleTableFull));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(h0), Some("a"));
        assert_eq!(table.get(h1), Some("b"));
    }

    #[test]
    fn for_each_sees_all_live_entries() {
        let table = HandleTable::new();
        table.insert("a").unwrap();
        table.insert("b").unwrap();
        let mut seen = Vec::new();
        table.for_each(|h, v| seen.push((h, *v)));
        seen.sort();
        assert_eq!(seen, vec![(0, "a"), (1, "b")]);
    }

    #[test]
    fn concurrent_inserts_yield_unique_handles() {
        let table = Arc::new(HandleTable::new());
        let mut workers = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            workers.push(thread::spawn(move || {
                (0..64).map(|i| table.insert(i).unwrap()).collect::<Vec<_>>()
            }));
        }
        let mut all = HashSet::new();
        for worker in workers {
            for handle in worker.join().unwrap() {
                assert!(handle >= 0);
                assert!(all.insert(handle), "duplicate handle {handle}");
            }
        }
        assert_eq!(all.len(), 8 * 64);
    }
}
