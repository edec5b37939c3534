//! Read-through caching for document stores.
//!
//! Pipeline state is re-read on every stage transition, so reads are served
//! from a short-lived cache. Every write through the wrapper invalidates the
//! cached document and every cached query on the same collection.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use super::document::{DocumentStore, Filter};
use crate::errors::NexusError;

/// Default lifetime of a cached read.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Cached value with its insertion time.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Map whose entries expire after a fixed time-to-live.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    /// Creates a cache whose entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a live entry, evicting it if it has expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            if entry.is_expired() {
                entries.remove(key);
                return None;
            }
            return Some(entry.value.clone());
        }
        None
    }

    /// Inserts or replaces an entry, dropping every expired one.
    pub fn insert(&self, key: K, value: V) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        let mut entries = self.entries.lock();
        entries.retain(|_, e| !e.is_expired());
        entries.insert(key, entry);
    }

    /// Removes an entry.
    pub fn invalidate(&self, key: &K) {
        self.entries.lock().remove(key);
    }

    /// Removes every entry whose key matches `predicate`.
    pub fn invalidate_where(&self, predicate: impl Fn(&K) -> bool) {
        self.entries.lock().retain(|k, _| !predicate(k));
    }

    /// Removes all entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Returns the number of entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

type DocKey = (String, String);

/// [`DocumentStore`] wrapper that caches reads and queries.
#[derive(Debug)]
pub struct CachedDocumentStore<S> {
    inner: S,
    documents: TtlCache<DocKey, Option<Value>>,
    queries: TtlCache<(String, String), Vec<(String, Value)>>,
}

impl<S: DocumentStore> CachedDocumentStore<S> {
    /// Wraps `inner` with the default TTL.
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self::with_ttl(inner, DEFAULT_CACHE_TTL)
    }

    /// Wraps `inner` with a custom TTL.
    #[must_use]
    pub fn with_ttl(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            documents: TtlCache::new(ttl),
            queries: TtlCache::new(ttl),
        }
    }

    /// Returns the wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Drops every cached entry.
    pub fn clear(&self) {
        self.documents.clear();
        self.queries.clear();
    }

    fn invalidate(&self, collection: &str, id: &str) {
        self.documents.invalidate(&(collection.to_string(), id.to_string()));
        self.queries.invalidate_where(|(c, _)| c == collection);
    }
}

#[async_trait]
impl<S: DocumentStore> DocumentStore for CachedDocumentStore<S> {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, NexusError> {
        let key = (collection.to_string(), id.to_string());
        if let Some(hit) = self.documents.get(&key) {
            return Ok(hit);
        }
        let value = self.inner.get(collection, id).await?;
        self.documents.insert(key, value.clone());
        Ok(value)
    }

    async fn set(&self, collection: &str, id: &str, document: Value) -> Result<(), NexusError> {
        self.invalidate(collection, id);
        self.inner.set(collection, id, document).await
    }

    async fn update(&self, collection: &str, id: &str, patch: Map<String, Value>) -> Result<(), NexusError> {
        self.invalidate(collection, id);
        self.inner.update(collection, id, patch).await
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<(String, Value)>, NexusError> {
        let key = (collection.to_string(), serde_json::to_string(filters)?);
        if let Some(hit) = self.queries.get(&key) {
            return Ok(hit);
        }
        let hits = self.inner.query(collection, filters).await?;
        self.queries.insert(key, hits.clone());
        Ok(hits)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), NexusError> {
        self.invalidate(collection, id);
        self.inner.delete(collection, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryDocumentStore;
    use serde_json::json;

    #[test]
    fn test_ttl_cache_expiration() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::ZERO);
        cache.insert("k", 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&"k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_insert_sweeps_expired_entries() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::ZERO);
        cache.insert("incidents|[]".to_string(), 1);
        cache.insert("review-queue|[]".to_string(), 2);
        cache.insert("pipelines|[]".to_string(), 3);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_ttl_cache_invalidate_where() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert(("a".to_string(), 1), 1);
        cache.insert(("b".to_string(), 1), 2);
        cache.invalidate_where(|(c, _)| c == "a");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&("b".to_string(), 1)), Some(2));
    }

    #[tokio::test]
    async fn test_reads_are_cached_until_write() {
        let store = CachedDocumentStore::new(InMemoryDocumentStore::new());
        store.set("pipelines", "p", json!({"v": 1})).await.unwrap();
        assert_eq!(store.get("pipelines", "p").await.unwrap(), Some(json!({"v": 1})));

        // Bypass the cache: the stale value is still served.
        store.inner().set("pipelines", "p", json!({"v": 2})).await.unwrap();
        assert_eq!(store.get("pipelines", "p").await.unwrap(), Some(json!({"v": 1})));

        store.set("pipelines", "p", json!({"v": 3})).await.unwrap();
        assert_eq!(store.get("pipelines", "p").await.unwrap(), Some(json!({"v": 3})));
    }

    #[tokio::test]
    async fn test_writes_invalidate_collection_queries() {
        let store = CachedDocumentStore::new(InMemoryDocumentStore::new());
        store.set("incidents", "a", json!({"date": "d"})).await.unwrap();
        let filters = [Filter::eq("date", "d")];
        assert_eq!(store.query("incidents", &filters).await.unwrap().len(), 1);

        store.set("incidents", "b", json!({"date": "d"})).await.unwrap();
        assert_eq!(store.query("incidents", &filters).await.unwrap().len(), 2);

        store.delete("incidents", "a").await.unwrap();
        assert_eq!(store.query("incidents", &filters).await.unwrap().len(), 1);
    }
}
