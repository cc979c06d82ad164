use std::fmt;
use std::num::NonZeroUsize;

use parking_lot::Mutex;

use super::Cache;
use super::ValueType;

/// Bounded in-memory backend evicting the least recently used entry.
pub struct LruCache<V> {
    inner: Mutex<lru::LruCache<String, V>>,
}

impl<V> LruCache<V> {
    pub fn new(max_capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(lru::LruCache::new(max_capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl<V> fmt::Debug for LruCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LruCache")
            .field("len", &inner.len())
            .field("cap", &inner.cap())
            .finish()
    }
}

impl<V: ValueType> Cache<V> for LruCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    fn add(&self, key: String, value: V) {
        self.inner.lock().put(key, value);
    }
}
