//! Cache storage adapters.
//!
//! The adapter surface is intentionally minimal and async-only with string
//! keys so alternative backings (disk, Redis) are drop-in. Items travel
//! opaquely; the coordinator owns all expiry logic.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type StoreError = Box<dyn std::error::Error + Send + Sync>;
pub type StoreResult<T> = Result<T, StoreError>;

/// A cached value plus its lifecycle stamps, in clock milliseconds.
///
/// `created_at ≤ stale_at ≤ expires_at` whenever `stale_at` is present.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheItem<V> {
    pub value: V,
    pub created_at: u64,
    pub expires_at: u64,
    pub stale_at: Option<u64>,
}

#[async_trait]
pub trait CacheStore<V>: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<CacheItem<V>>>;
    async fn set(&self, key: &str, item: CacheItem<V>) -> StoreResult<()>;
    /// Returns whether the key was present.
    async fn delete(&self, key: &str) -> StoreResult<bool>;
    async fn has(&self, key: &str) -> StoreResult<bool>;
    async fn clear(&self) -> StoreResult<()>;
    async fn size(&self) -> StoreResult<usize>;
    /// Key enumeration, for predicate and path-pattern invalidation.
    async fn keys(&self) -> StoreResult<Vec<String>>;
}

/// Built-in in-memory store. Operations are atomic under one mutex.
#[derive(Debug)]
pub struct InMemoryStore<V> {
    data: Arc<Mutex<HashMap<String, CacheItem<V>>>>,
}

impl<V> Default for InMemoryStore<V> {
    fn default() -> Self {
        Self { data: Arc::new(Mutex::new(HashMap::new())) }
    }
}

impl<V> Clone for InMemoryStore<V> {
    fn clone(&self) -> Self {
        Self { data: Arc::clone(&self.data) }
    }
}

impl<V> InMemoryStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheItem<V>>> {
        self.data.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl<V: Clone + Send + Sync> CacheStore<V> for InMemoryStore<V> {
    async fn get(&self, key: &str) -> StoreResult<Option<CacheItem<V>>> {
        Ok(self.guard().get(key).cloned())
    }

    async fn set(&self, key: &str, item: CacheItem<V>) -> StoreResult<()> {
        self.guard().insert(key.to_string(), item);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.guard().remove(key).is_some())
    }

    async fn has(&self, key: &str) -> StoreResult<bool> {
        Ok(self.guard().contains_key(key))
    }

    async fn clear(&self) -> StoreResult<()> {
        self.guard().clear();
        Ok(())
    }

    async fn size(&self) -> StoreResult<usize> {
        Ok(self.guard().len())
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.guard().keys().cloned().collect())
    }
}
