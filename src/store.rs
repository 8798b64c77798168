// Keyed in-memory state shared by the admission and abuse trackers.
//
// Both trackers only need per-key read-modify-write plus a periodic sweep,
// so they are written against `StateStore`. `MemoryStore` keeps
// everything in a `DashMap`; a store backed by a shared cache can be slotted
// in when more than one gateway replica has to enforce the same limits.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::hash::Hash;

pub trait StateStore<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;

    fn set(&self, key: K, value: V);

    // Returns whether an entry was removed.
    fn delete(&self, key: &K) -> bool;

    // Atomically applies `update` to the entry for `key`, seeding it with
    // `init` first when absent. The flag passed to `update` is `true` when
    // the entry was just created.
    fn upsert<R>(
        &self,
        key: K,
        init: impl FnOnce() -> V,
        update: impl FnOnce(&mut V, bool) -> R,
    ) -> R;

    // Drops every entry for which `keep` returns false; returns the count.
    fn sweep(&self, keep: impl FnMut(&K, &V) -> bool) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct MemoryStore<K, V> {
    map: DashMap<K, V>,
}

impl<K: Eq + Hash, V> MemoryStore<K, V> {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }
}

impl<K: Eq + Hash, V> Default for MemoryStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> StateStore<K, V> for MemoryStore<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<V> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: K, value: V) {
        self.map.insert(key, value);
    }

    fn delete(&self, key: &K) -> bool {
        self.map.remove(key).is_some()
    }

    fn upsert<R>(
        &self,
        key: K,
        init: impl FnOnce() -> V,
        update: impl FnOnce(&mut V, bool) -> R,
    ) -> R {
        // the shard lock is held for the whole update
        match self.map.entry(key) {
            Entry::Occupied(mut occupied) => update(occupied.get_mut(), false),
            Entry::Vacant(vacant) => {
                let mut entry = vacant.insert(init());
                update(entry.value_mut(), true)
            }
        }
    }

    fn sweep(&self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
        let mut removed = 0;
        self.map.retain(|key, value| {
            let kept = keep(key, value);
            if !kept {
                removed += 1;
            }
            kept
        });
        removed
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}
