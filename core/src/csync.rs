//! Thread-safe containers shared between the supervisors.
//!
//! `Map` and `Slice` guard plain collections behind reader-writer locks and
//! expose snapshot iteration that never blocks writers for the duration of
//! the iteration. `LockMap` lazily materialises one async mutex per key; the
//! MCP supervisor uses it to serialize restarts of a single server without
//! blocking operations on the others.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use tokio::sync::Mutex;

/// Reader-writer locked key/value table.
#[derive(Debug)]
pub struct Map<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for Map<K, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V> Map<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: K, value: V) {
        self.write().insert(key, value);
    }

    pub fn delete(&self, key: &K) {
        self.write().remove(key);
    }

    /// Atomic get+delete.
    pub fn take(&self, key: &K) -> Option<V> {
        self.write().remove(key)
    }

    /// Remove every entry and return the previous contents.
    pub fn drain(&self) -> Vec<(K, V)> {
        self.write().drain().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.read().contains_key(key)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<K, V>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<K, V>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Map<K, V> {
    pub fn get(&self, key: &K) -> Option<V> {
        self.read().get(key).cloned()
    }

    /// Point-in-time view; writers are not blocked while the caller iterates.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Append-only guarded sequence.
#[derive(Debug)]
pub struct Slice<T> {
    inner: RwLock<Vec<T>>,
}

impl<T> Default for Slice<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Vec::new()),
        }
    }
}

impl<T> Slice<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, value: T) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value);
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Slice<T> {
    pub fn snapshot(&self) -> Vec<T> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Per-key mutual exclusion with lazy materialisation.
#[derive(Debug)]
pub struct LockMap<K> {
    locks: std::sync::Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for LockMap<K> {
    fn default() -> Self {
        Self {
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> LockMap<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mutex for `key`, creating it on first use. Callers hold
    /// the returned lock only for the critical section, never across
    /// unrelated awaits.
    pub fn lock_for(&self, key: &K) -> Arc<Mutex<()>> {
        let mut guard = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn map_take_is_get_and_delete() {
        let map: Map<String, i32> = Map::new();
        map.set("a".into(), 1);
        assert_eq!(map.take(&"a".to_string()), Some(1));
        assert_eq!(map.take(&"a".to_string()), None);
        assert!(map.is_empty());
    }

    #[test]
    fn map_snapshot_is_point_in_time() {
        let map: Map<String, i32> = Map::new();
        map.set("a".into(), 1);
        map.set("b".into(), 2);
        let snap = map.snapshot();
        map.set("c".into(), 3);
        assert_eq!(snap.len(), 2);
        assert_eq!(map.len(), 3);
    }

    #[tokio::test]
    async fn lock_map_returns_the_same_lock_per_key() {
        let locks: LockMap<String> = LockMap::new();
        let a1 = locks.lock_for(&"a".to_string());
        let a2 = locks.lock_for(&"a".to_string());
        assert!(Arc::ptr_eq(&a1, &a2));

        let b = locks.lock_for(&"b".to_string());
        assert!(!Arc::ptr_eq(&a1, &b));

        // Holding "a" must not block "b".
        let _guard = a1.lock().await;
        let acquired =
            tokio::time::timeout(std::time::Duration::from_millis(50), b.lock()).await;
        assert!(acquired.is_ok());
    }

    #[test]
    fn slice_appends_in_order() {
        let slice: Slice<i32> = Slice::new();
        slice.push(1);
        slice.push(2);
        assert_eq!(slice.snapshot(), vec![1, 2]);
        assert_eq!(slice.len(), 2);
    }
}
