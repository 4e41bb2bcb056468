//! Insertion-ordered, value-deduplicating tables.
//!
//! Every entity in the profile (threads, images, contexts) is stored once and
//! referred to everywhere else by a small 1-based handle. Inserting a value
//! equal to one already stored returns the existing handle.

use std::collections::{HashMap, HashSet};
use std::hash::{BuildHasherDefault, Hash};
use std::marker::PhantomData;

use crate::domain::Handle;

pub type FxBuildHasher = BuildHasherDefault<rustc_hash::FxHasher>;
pub type FxIndexMap<K, V> = indexmap::IndexMap<K, V, FxBuildHasher>;
pub type FxIndexSet<K> = indexmap::IndexSet<K, FxBuildHasher>;
pub type FxHashMap<K, V> = HashMap<K, V, FxBuildHasher>;
pub type FxHashSet<K> = HashSet<K, FxBuildHasher>;

/// A deduplicating table handing out handles of type `H`.
#[derive(Debug, Clone)]
pub struct EntityTable<T, H> {
    items: FxIndexSet<T>,
    _handle: PhantomData<H>,
}

impl<T, H> Default for EntityTable<T, H> {
    fn default() -> Self {
        Self { items: FxIndexSet::default(), _handle: PhantomData }
    }
}

impl<T: Eq + Hash, H: Handle> EntityTable<T, H> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `item` unless an equal value exists, returning its handle.
    pub fn add(&mut self, item: T) -> H {
        let (offset, _) = self.items.insert_full(item);
        H::from_offset(offset)
    }

    /// Handle of a stored value equal to `item`, if any.
    pub fn handle_of(&self, item: &T) -> Option<H> {
        self.items.get_index_of(item).map(H::from_offset)
    }

    /// # Panics
    /// Panics if `handle` was not produced by this table. Handles are only
    /// ever minted by `add`, so an unknown handle is a programming error.
    #[must_use]
    pub fn find(&self, handle: H) -> &T {
        handle
            .offset()
            .and_then(|offset| self.items.get_index(offset))
            .unwrap_or_else(|| panic!("handle out of range (table has {} entries)", self.len()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Entries with their handles, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (H, &T)> {
        self.items.iter().enumerate().map(|(offset, item)| (H::from_offset(offset), item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ThreadHandle;

    #[test]
    fn test_equal_values_share_a_handle() {
        let mut table: EntityTable<&str, ThreadHandle> = EntityTable::new();
        let a = table.add("worker");
        let b = table.add("main");
        let c = table.add("worker");

        assert_eq!(a, ThreadHandle(1));
        assert_eq!(b, ThreadHandle(2));
        assert_eq!(a, c);
        assert_eq!(table.len(), 2);
        assert_eq!(*table.find(b), "main");
        assert_eq!(table.handle_of(&"main"), Some(b));
    }

    #[test]
    fn test_iter_in_insertion_order() {
        let mut table: EntityTable<u32, ThreadHandle> = EntityTable::new();
        table.add(30);
        table.add(10);
        let handles: Vec<_> = table.iter().map(|(h, v)| (h.0, *v)).collect();
        assert_eq!(handles, vec![(1, 30), (2, 10)]);
    }

    #[test]
    #[should_panic(expected = "handle out of range")]
    fn test_find_out_of_range_panics() {
        let table: EntityTable<u32, ThreadHandle> = EntityTable::new();
        let _ = table.find(ThreadHandle(3));
    }

    #[test]
    #[should_panic(expected = "handle out of range")]
    fn test_find_none_handle_panics() {
        let mut table: EntityTable<u32, ThreadHandle> = EntityTable::new();
        table.add(1);
        let _ = table.find(ThreadHandle::NONE);
    }
}
