//! Redis-backed cache client
//!
//! Entries are written with a plain `SET` (no expiry) and fetched in bulk
//! with a single `MGET`. Connections are checked out of a bounded pool for
//! the duration of one command.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use crate::CacheConfig;
use crate::cache_client::CacheClient;
use crate::error::CacheError;
use crate::pool::{Pool, Pooled};

const POOL_NAME: &str = "redis-cache";

pub struct RedisCacheClient {
    pool: Pool<ConnectionManager>,
}

impl RedisCacheClient {
    /// Open `config.pool_size` managed connections to the given Redis server
    pub async fn connect(
        redis_client: redis::Client,
        config: &CacheConfig,
    ) -> Result<Self, redis::RedisError> {
        let mut connections = Vec::with_capacity(config.pool_size.max(1));
        for _ in 0..config.pool_size.max(1) {
            connections.push(ConnectionManager::new(redis_client.clone()).await?);
        }
        debug!(
            "RedisCacheClient: opened {} pooled connections",
            connections.len()
        );

        Ok(Self {
            pool: Pool::new(POOL_NAME, connections, config.pool_acquire_timeout),
        })
    }

    async fn connection(&self) -> Result<Pooled<'_, ConnectionManager>, CacheError> {
        Ok(self.pool.acquire().await?)
    }
}

#[async_trait]
impl CacheClient for RedisCacheClient {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.connection().await?;
        let value = conn.get::<_, Option<Vec<u8>>>(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, CacheError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut conn = self.connection().await?;
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut *conn)
            .await?;

        if values.len() != keys.len() {
            warn!(
                "Redis MGET returned {} values for {} keys",
                values.len(),
                keys.len()
            );
        }

        Ok(keys
            .iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key.clone(), v)))
            .collect())
    }
}
