//! Stable-address record tables keyed by host identifiers.
//!
//! A [`Registry`] maps host ids to reference-counted records. Records are
//! never freed while the registry lives: [`Registry::unlink`] removes only the
//! id mapping, so a pointer taken from a record (by an in-flight signal
//! handler, a queued log notification or a function handle held by the host)
//! stays valid after the host recycles the id.
//!
//! Internal ids are dense and assigned in creation order, including records
//! added without a host id (see [`Registry::add`]).

use exectrace_common::InternalId;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub struct Registry<K, V> {
    inner: RwLock<Inner<K, V>>,
}

struct Inner<K, V> {
    linked: HashMap<K, Arc<V>>,
    records: Vec<Arc<V>>,
}

impl<K, V> Inner<K, V> {
    fn create(&mut self, make: impl FnOnce(InternalId) -> V) -> Arc<V> {
        let internal_id = InternalId(u32::try_from(self.records.len()).unwrap_or(u32::MAX));
        let record = Arc::new(make(internal_id));
        self.records.push(Arc::clone(&record));
        record
    }
}

impl<K: Copy + Eq + Hash, V> Registry<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner { linked: HashMap::new(), records: Vec::new() }) }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<K, V>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<K, V>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the record linked to `key`, creating it with `make` if absent.
    ///
    /// The flag is true when the record was created by this call.
    pub fn place_with(&self, key: K, make: impl FnOnce(InternalId) -> V) -> (Arc<V>, bool) {
        if let Some(record) = self.read().linked.get(&key) {
            return (Arc::clone(record), false);
        }

        let mut inner = self.write();
        // Another thread may have linked the key between the two locks.
        if let Some(record) = inner.linked.get(&key) {
            return (Arc::clone(record), false);
        }
        let record = inner.create(make);
        inner.linked.insert(key, Arc::clone(&record));
        (record, true)
    }

    /// Creates a record that no host id maps to.
    pub fn add(&self, make: impl FnOnce(InternalId) -> V) -> Arc<V> {
        self.write().create(make)
    }

    pub fn get(&self, key: K) -> Option<Arc<V>> {
        self.read().linked.get(&key).map(Arc::clone)
    }

    /// Removes the id mapping. The record itself stays alive.
    pub fn unlink(&self, key: K) -> Option<Arc<V>> {
        self.write().linked.remove(&key)
    }

    /// Visits every linked record under the shared lock.
    ///
    /// Lookups from other threads proceed concurrently; insertions and
    /// unlinks wait until the visit finishes.
    pub fn for_each_linked(&self, mut visit: impl FnMut(&V)) {
        for record in self.read().linked.values() {
            visit(record);
        }
    }

    /// Number of records currently linked to a host id.
    pub fn linked_len(&self) -> usize {
        self.read().linked.len()
    }

    /// Number of records ever created.
    pub fn record_count(&self) -> usize {
        self.read().records.len()
    }
}

impl<K: Copy + Eq + Hash, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Debug)]
    struct Record {
        id: InternalId,
        key: u64,
    }

    fn place(registry: &Registry<u64, Record>, key: u64) -> (Arc<Record>, bool) {
        registry.place_with(key, |id| Record { id, key })
    }

    #[test]
    fn test_place_twice_returns_same_record() {
        let registry = Registry::new();
        let (first, inserted) = place(&registry, 42);
        assert!(inserted);
        let (second, inserted) = place(&registry, 42);
        assert!(!inserted);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.key, 42);
    }

    #[test]
    fn test_unlink_then_place_creates_distinct_record() {
        let registry = Registry::new();
        let (old, _) = place(&registry, 7);
        let unlinked = registry.unlink(7).unwrap();
        assert!(Arc::ptr_eq(&old, &unlinked));
        assert!(registry.get(7).is_none());

        let (new, inserted) = place(&registry, 7);
        assert!(inserted);
        assert!(!Arc::ptr_eq(&old, &new));
        assert_ne!(old.id, new.id);
        // The unlinked record is still owned by the registry.
        assert_eq!(Arc::strong_count(&old), 2);
        assert_eq!(registry.record_count(), 2);
        assert_eq!(registry.linked_len(), 1);
    }

    #[test]
    fn test_internal_ids_are_dense_including_unkeyed_records() {
        let registry = Registry::new();
        let special = registry.add(|id| Record { id, key: 0 });
        let (a, _) = place(&registry, 1);
        let (b, _) = place(&registry, 2);
        assert_eq!(special.id, InternalId(0));
        assert_eq!(a.id, InternalId(1));
        assert_eq!(b.id, InternalId(2));
        assert_eq!(registry.linked_len(), 2);
    }

    #[test]
    fn test_for_each_linked_skips_unlinked() {
        let registry = Registry::new();
        for key in 1..=3 {
            place(&registry, key);
        }
        registry.unlink(2);
        let mut keys = Vec::new();
        registry.for_each_linked(|record| keys.push(record.key));
        keys.sort_unstable();
        assert_eq!(keys, vec![1, 3]);
    }

    #[test]
    fn test_concurrent_place_links_one_record_per_key() {
        let registry = Registry::new();
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for key in 0..100 {
                        place(&registry, key);
                    }
                });
            }
        });
        assert_eq!(registry.linked_len(), 100);
        assert_eq!(registry.record_count(), 100);
    }
}
