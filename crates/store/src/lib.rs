//! Shoal store: keyed in-RAM cache of the last known state of each object.

#![forbid(unsafe_code)]

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use metrics::gauge;
use rustc_hash::FxHashMap;
use shoal_core::{Key, KeyFn, StoreError};
use tokio::sync::watch;
use tracing::trace;

/// Thread-safe map from derived key to object.
///
/// `add` and `update` are both upserts; the distinction is for callers.
/// Every mutation bumps the store epoch, observable via [`subscribe_epoch`](Self::subscribe_epoch).
pub struct ObjectStore<T> {
    key_fn: KeyFn<T>,
    items: RwLock<FxHashMap<Key, Arc<T>>>,
    epoch_tx: watch::Sender<u64>,
}

impl<T> ObjectStore<T> {
    pub fn new(key_fn: KeyFn<T>) -> Self {
        let (epoch_tx, _rx) = watch::channel(0u64);
        Self { key_fn, items: RwLock::new(FxHashMap::default()), epoch_tx }
    }

    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<Key, Arc<T>>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<Key, Arc<T>>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self, len: usize) {
        self.epoch_tx.send_modify(|e| *e = e.saturating_add(1));
        gauge!("store_objects", len as f64);
    }

    /// Derive the key for `obj` with the configured key function.
    pub fn key_of(&self, obj: &T) -> Result<Key, StoreError> {
        (self.key_fn)(obj)
    }

    /// Insert or replace `obj`; returns the value previously stored under its key.
    pub fn add(&self, obj: impl Into<Arc<T>>) -> Result<Option<Arc<T>>, StoreError> {
        let obj = obj.into();
        let key = self.key_of(&obj)?;
        let (prev, len) = {
            let mut items = self.write();
            let prev = items.insert(key.clone(), obj);
            (prev, items.len())
        };
        trace!(key = %key, replaced = prev.is_some(), "store upsert");
        self.bump(len);
        Ok(prev)
    }

    /// Same as [`add`](Self::add).
    pub fn update(&self, obj: impl Into<Arc<T>>) -> Result<Option<Arc<T>>, StoreError> {
        self.add(obj)
    }

    /// Remove the entry at `key(obj)`. Absent keys are not an error.
    pub fn delete(&self, obj: &T) -> Result<Option<Arc<T>>, StoreError> {
        let key = self.key_of(obj)?;
        Ok(self.delete_by_key(&key))
    }

    pub fn delete_by_key(&self, key: &str) -> Option<Arc<T>> {
        let (prev, len) = {
            let mut items = self.write();
            let prev = items.remove(key);
            (prev, items.len())
        };
        if prev.is_some() {
            trace!(key = %key, "store delete");
            self.bump(len);
        }
        prev
    }

    pub fn get(&self, obj: &T) -> Result<Option<Arc<T>>, StoreError> {
        let key = self.key_of(obj)?;
        Ok(self.get_by_key(&key))
    }

    pub fn get_by_key(&self, key: &str) -> Option<Arc<T>> {
        self.read().get(key).cloned()
    }

    /// Snapshot of all objects, in no particular order.
    pub fn list(&self) -> Vec<Arc<T>> {
        self.read().values().cloned().collect()
    }

    pub fn list_keys(&self) -> Vec<Key> {
        self.read().keys().cloned().collect()
    }

    /// Snapshot of `(key, object)` pairs.
    pub fn entries(&self) -> Vec<(Key, Arc<T>)> {
        self.read().iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
    }

    /// Swap the whole content for `objs`. Every key is derived before the
    /// store is touched, so a bad object leaves the previous content intact.
    pub fn replace<I, O>(&self, objs: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = O>,
        O: Into<Arc<T>>,
    {
        let mut next = FxHashMap::default();
        for obj in objs {
            let obj = obj.into();
            let key = self.key_of(&obj)?;
            next.insert(key, obj);
        }
        let len = next.len();
        *self.write() = next;
        self.bump(len);
        Ok(())
    }

    pub fn clear(&self) {
        self.write().clear();
        self.bump(0);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of mutations applied so far.
    pub fn epoch(&self) -> u64 {
        *self.epoch_tx.borrow()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }
}

/// Read-only, cloneable view of an [`ObjectStore`].
pub struct Lister<T> {
    store: Arc<ObjectStore<T>>,
}

impl<T> Clone for Lister<T> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store) }
    }
}

impl<T> Lister<T> {
    pub fn new(store: Arc<ObjectStore<T>>) -> Self {
        Self { store }
    }

    pub fn get(&self, obj: &T) -> Result<Option<Arc<T>>, StoreError> {
        self.store.get(obj)
    }

    pub fn get_by_key(&self, key: &str) -> Option<Arc<T>> {
        self.store.get_by_key(key)
    }

    pub fn list(&self) -> Vec<Arc<T>> {
        self.store.list()
    }

    pub fn list_keys(&self) -> Vec<Key> {
        self.store.list_keys()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.store.epoch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::key_fn;

    fn store() -> ObjectStore<(String, u32)> {
        ObjectStore::new(key_fn(|o: &(String, u32)| Ok(o.0.clone())))
    }

    #[test]
    fn upsert_returns_previous() {
        let s = store();
        assert_eq!(s.add(("a".to_string(), 1u32)).unwrap(), None);
        let prev = s.update(("a".to_string(), 2u32)).unwrap();
        assert_eq!(prev.as_deref(), Some(&("a".to_string(), 1u32)));
        assert_eq!(s.len(), 1);
        assert_eq!(s.get_by_key("a").unwrap().1, 2);
    }

    #[test]
    fn epoch_counts_mutations() {
        let s = store();
        let rx = s.subscribe_epoch();
        s.add(("a".to_string(), 1u32)).unwrap();
        s.add(("b".to_string(), 1u32)).unwrap();
        // deleting a missing key is not a mutation
        assert!(s.delete_by_key("zz").is_none());
        s.delete_by_key("a");
        assert_eq!(s.epoch(), 3);
        assert_eq!(*rx.borrow(), 3);
    }
}
