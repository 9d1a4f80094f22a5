//! Cache capability and the in-process implementation
//!
//! The cache is ephemeral: entries have no expiry and may vanish at any time.
//! Losing an entry only costs a backend round trip, so nothing here is ever
//! treated as the source of truth.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;

use crate::error::CacheError;

/// Opaque byte cache keyed by string
#[async_trait]
pub trait CacheClient: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Fetch several keys in one round trip. Misses are absent from the map.
    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, CacheError>;
}

#[async_trait]
impl<C: CacheClient + ?Sized> CacheClient for Arc<C> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        (**self).set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        (**self).delete(key).await
    }

    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, CacheError> {
        (**self).multi_get(keys).await
    }
}

/// In-process cache backed by Moka; capacity-bounded, no TTL
#[derive(Clone)]
pub struct MokaCacheClient {
    cache: Cache<String, Arc<[u8]>>,
}

impl MokaCacheClient {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder().max_capacity(max_capacity).build(),
        }
    }

    /// Whether the key is currently resident
    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }
}

impl Default for MokaCacheClient {
    fn default() -> Self {
        Self::new(crate::CacheConfig::default().l1_max_capacity)
    }
}

#[async_trait]
impl CacheClient for MokaCacheClient {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.cache.get(key).await.map(|bytes| bytes.to_vec()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        self.cache.insert(key.to_owned(), Arc::from(value)).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, CacheError> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = self.cache.get(key).await {
                found.insert(key.clone(), bytes.to_vec());
            }
        }
        Ok(found)
    }
}
