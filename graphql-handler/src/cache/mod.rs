//! Pluggable key/value stores shared by every request of a server.
//!
//! The query document cache and the persisted query store both go through the
//! [`Cache`] trait, so deployments can substitute their own backend.

use std::fmt;

use dashmap::DashMap;

pub use self::storage::LruCache;

mod storage;

/// Values held by a [`Cache`] are cloned out on every hit.
pub trait ValueType: Clone + Send + Sync + 'static {}

// Blanket implementation which satisfies the compiler
impl<V> ValueType for V where V: Clone + Send + Sync + 'static {}

/// A string-keyed store safe for concurrent reads and writes.
///
/// A `get` racing an `add` for the same key may observe either the previous state or
/// the freshly written value, never a partial one.
pub trait Cache<V: ValueType>: Send + Sync {
    /// Returns the value stored under `key`, if any.
    fn get(&self, key: &str) -> Option<V>;

    /// Stores `value` under `key`, replacing any previous value.
    fn add(&self, key: String, value: V);
}

/// Unbounded in-memory backend: entries live as long as the server.
pub struct InMemoryCache<V> {
    inner: DashMap<String, V>,
}

impl<V> InMemoryCache<V> {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<V> Default for InMemoryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for InMemoryCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCache")
            .field("len", &self.inner.len())
            .finish()
    }
}

impl<V: ValueType> Cache<V> for InMemoryCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        self.inner.get(key).map(|entry| entry.value().clone())
    }

    fn add(&self, key: String, value: V) {
        self.inner.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn add_overwrites() {
        let cache = InMemoryCache::new();
        assert_eq!(cache.get("{ name }"), None);
        cache.add("{ name }".to_string(), 1);
        assert_eq!(cache.get("{ name }"), Some(1));
        cache.add("{ name }".to_string(), 2);
        assert_eq!(cache.get("{ name }"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_readers_and_writers() {
        let cache: Arc<dyn Cache<usize>> = Arc::new(InMemoryCache::new());
        let mut handles = Vec::new();
        for task in 0..8usize {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..200usize {
                    let key = format!("query-{}", i % 16);
                    cache.add(key.clone(), task * 1000 + i);
                    // a concurrent write may replace ours but never leaves the key empty
                    assert!(cache.get(&key).is_some());
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        for i in 0..16 {
            assert!(cache.get(&format!("query-{i}")).is_some());
        }
    }
}
