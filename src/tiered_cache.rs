//! Two-tier cache client
//!
//! Composes a process-local Moka tier (L1) in front of a shared cache (L2,
//! typically [`RedisCacheClient`](crate::RedisCacheClient)):
//! - Reads try L1 first, then L2, populating L1 on an L2 hit
//! - Writes go to L2 first; L1 is only updated once L2 accepted the value
//! - Deletes clear both tiers
//!
//! L1 is per process. With several instances sharing one L2, enable Redis
//! pub/sub invalidation ([`TieredCacheClient::with_redis_invalidation`]) so a
//! set or delete on one instance evicts the key from every other L1. Entries
//! also expire after `CacheConfig::l1_ttl`, which bounds staleness when a
//! message is lost.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use moka::future::Cache;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, PubSub};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::CacheConfig;
use crate::cache_client::CacheClient;
use crate::error::CacheError;

type L1 = Cache<String, Arc<[u8]>>;

static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(0);

/// Publisher side of the invalidation channel plus the subscriber task
struct Invalidation {
    origin: String,
    channel: String,
    publisher: ConnectionManager,
    listener: JoinHandle<()>,
}

impl Drop for Invalidation {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

pub struct TieredCacheClient<L2> {
    l1: L1,
    l2: L2,
    channel: String,
    invalidation: Option<Invalidation>,
}

impl<L2: CacheClient> TieredCacheClient<L2> {
    pub fn new(l2: L2, config: &CacheConfig) -> Self {
        let mut builder = Cache::builder().max_capacity(config.l1_max_capacity);
        if let Some(ttl) = config.l1_ttl {
            builder = builder.time_to_live(ttl);
        }
        Self {
            l1: builder.build(),
            l2,
            channel: config.invalidation_channel.clone(),
            invalidation: None,
        }
    }

    /// Share L1 invalidations with other instances over Redis pub/sub.
    ///
    /// Every successful `set` and `delete` publishes the key on
    /// `CacheConfig::invalidation_channel`; keys published by other instances
    /// are evicted from this L1.
    pub async fn with_redis_invalidation(
        mut self,
        redis_client: redis::Client,
    ) -> Result<Self, redis::RedisError> {
        let pubsub = subscribe(&redis_client, &self.channel).await?;
        let publisher = ConnectionManager::new(redis_client.clone()).await?;
        let origin = format!(
            "{}-{}",
            std::process::id(),
            NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed)
        );
        debug!(
            "TieredCacheClient: subscribed to invalidation channel {} as {}",
            self.channel, origin
        );

        let listener = tokio::spawn(listen(
            self.l1.clone(),
            redis_client,
            self.channel.clone(),
            origin.clone(),
            pubsub,
        ));
        self.invalidation = Some(Invalidation {
            origin,
            channel: self.channel.clone(),
            publisher,
            listener,
        });
        Ok(self)
    }

    /// The shared tier
    pub fn l2(&self) -> &L2 {
        &self.l2
    }

    async fn announce(&self, key: &str) -> Result<(), CacheError> {
        let Some(invalidation) = &self.invalidation else {
            return Ok(());
        };
        let mut conn = invalidation.publisher.clone();
        conn.publish::<_, _, ()>(
            &invalidation.channel,
            format!("{}\n{}", invalidation.origin, key),
        )
        .await
        .map_err(|e| {
            warn!("Failed to publish invalidation for key {}: {}", key, e);
            CacheError::from(e)
        })
    }
}

async fn subscribe(redis_client: &redis::Client, channel: &str) -> redis::RedisResult<PubSub> {
    let mut pubsub = redis_client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    Ok(pubsub)
}

/// Evict keys published by other instances; resubscribe with backoff when the
/// connection drops, clearing L1 since messages may have been missed.
async fn listen(
    l1: L1,
    redis_client: redis::Client,
    channel: String,
    origin: String,
    mut pubsub: PubSub,
) {
    let mut delay = Duration::from_millis(100);
    loop {
        let mut messages = pubsub.into_on_message();
        while let Some(msg) = messages.next().await {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("TieredCacheClient: failed to decode invalidation payload: {}", e);
                    continue;
                }
            };
            let Some((from, key)) = payload.split_once('\n') else {
                warn!("TieredCacheClient: malformed invalidation payload: {}", payload);
                continue;
            };
            if from != origin {
                debug!("Invalidating L1 for key {} (published by {})", key, from);
                l1.invalidate(key).await;
            }
        }
        drop(messages);

        warn!(
            "TieredCacheClient: invalidation subscription on {} closed; clearing L1",
            channel
        );
        l1.invalidate_all();

        pubsub = loop {
            tokio::time::sleep(delay).await;
            match subscribe(&redis_client, &channel).await {
                Ok(pubsub) => {
                    debug!("TieredCacheClient: resubscribed to {}", channel);
                    delay = Duration::from_millis(100);
                    break pubsub;
                }
                Err(e) => {
                    error!("TieredCacheClient: resubscribe to {} failed: {}", channel, e);
                    delay = delay.saturating_mul(2).min(Duration::from_secs(2));
                }
            }
        };
    }
}

#[async_trait]
impl<L2: CacheClient> CacheClient for TieredCacheClient<L2> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        if let Some(value) = self.l1.get(key).await {
            debug!("Cache hit L1 for key: {}", key);
            return Ok(Some(value.to_vec()));
        }

        debug!("Cache miss L1 for key: {}", key);

        match self.l2.get(key).await? {
            Some(value) => {
                debug!("Cache hit L2 for key: {}", key);
                self.l1
                    .insert(key.to_owned(), Arc::from(value.as_slice()))
                    .await;
                Ok(Some(value))
            }
            None => {
                debug!("Cache miss L2 for key: {}", key);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        if let Err(e) = self.l2.set(key, value).await {
            // Keep L1 from serving a value L2 never saw.
            self.l1.invalidate(key).await;
            return Err(e);
        }
        self.l1.insert(key.to_owned(), Arc::from(value)).await;
        self.announce(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        debug!("Invalidating cache for key: {}", key);
        self.l1.invalidate(key).await;

        if let Err(e) = self.l2.delete(key).await {
            warn!("L2 DEL error for key {}: {}", key, e);
            return Err(e);
        }
        self.announce(key).await
    }

    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, CacheError> {
        let mut found = HashMap::with_capacity(keys.len());
        let mut l1_missing = Vec::new();

        for key in keys {
            match self.l1.get(key).await {
                Some(value) => {
                    found.insert(key.clone(), value.to_vec());
                }
                None => l1_missing.push(key.clone()),
            }
        }

        if l1_missing.is_empty() {
            return Ok(found);
        }

        debug!(
            "Cache multi-get: {} hits in L1, {} keys to L2",
            found.len(),
            l1_missing.len()
        );

        for (key, value) in self.l2.multi_get(&l1_missing).await? {
            self.l1
                .insert(key.clone(), Arc::from(value.as_slice()))
                .await;
            found.insert(key, value);
        }

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::MokaCacheClient;

    /// L2 that counts calls and can be switched off
    struct CountingL2 {
        inner: MokaCacheClient,
        gets: AtomicUsize,
        down: std::sync::atomic::AtomicBool,
    }

    impl CountingL2 {
        fn new() -> Self {
            Self {
                inner: MokaCacheClient::new(100),
                gets: AtomicUsize::new(0),
                down: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn check(&self) -> Result<(), CacheError> {
            if self.down.load(Ordering::SeqCst) {
                Err(CacheError::Other("l2 down".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CacheClient for CountingL2 {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            self.check()?;
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
            self.check()?;
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.check()?;
            self.inner.delete(key).await
        }

        async fn multi_get(
            &self,
            keys: &[String],
        ) -> Result<HashMap<String, Vec<u8>>, CacheError> {
            self.check()?;
            self.gets.fetch_add(keys.len(), Ordering::SeqCst);
            self.inner.multi_get(keys).await
        }
    }

    #[tokio::test]
    async fn l2_hit_populates_l1() {
        let l2 = CountingL2::new();
        l2.inner.set("m1", b"v1").await.unwrap();
        let tiered = TieredCacheClient::new(l2, &CacheConfig::default());

        assert_eq!(tiered.get("m1").await.unwrap().as_deref(), Some(&b"v1"[..]));
        assert_eq!(tiered.get("m1").await.unwrap().as_deref(), Some(&b"v1"[..]));
        assert_eq!(tiered.l2().gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_l2_set_leaves_l1_empty() {
        let tiered = TieredCacheClient::new(CountingL2::new(), &CacheConfig::default());
        tiered.l2().down.store(true, Ordering::SeqCst);

        assert!(tiered.set("m1", b"v1").await.is_err());
        tiered.l2().down.store(false, Ordering::SeqCst);
        assert_eq!(tiered.get("m1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_clears_both_tiers() {
        let tiered = TieredCacheClient::new(CountingL2::new(), &CacheConfig::default());
        tiered.set("m1", b"v1").await.unwrap();
        tiered.delete("m1").await.unwrap();

        assert_eq!(tiered.get("m1").await.unwrap(), None);
        assert_eq!(tiered.l2().inner.get("m1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn other_instances_l1_staleness_is_bounded_by_ttl() {
        let shared = Arc::new(MokaCacheClient::new(100));
        let config = CacheConfig {
            l1_ttl: Some(Duration::from_millis(100)),
            ..CacheConfig::default()
        };
        let a = TieredCacheClient::new(Arc::clone(&shared), &config);
        let b = TieredCacheClient::new(Arc::clone(&shared), &config);

        b.set("m1", b"v1").await.unwrap();
        assert_eq!(a.get("m1").await.unwrap().as_deref(), Some(&b"v1"[..]));

        b.delete("m1").await.unwrap();
        // Without pub/sub, A keeps its L1 copy until the TTL runs out
        assert_eq!(a.get("m1").await.unwrap().as_deref(), Some(&b"v1"[..]));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(a.get("m1").await.unwrap(), None);
    }

    #[test]
    fn default_config_bounds_l1_lifetime() {
        assert!(CacheConfig::default().l1_ttl.is_some());
    }

    #[tokio::test]
    async fn multi_get_only_asks_l2_for_l1_misses() {
        let tiered = TieredCacheClient::new(CountingL2::new(), &CacheConfig::default());
        tiered.set("a", b"1").await.unwrap();
        tiered.l2().inner.set("b", b"2").await.unwrap();

        let keys = vec!["a".to_owned(), "b".to_owned(), "c".to_owned()];
        let found = tiered.multi_get(&keys).await.unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found["b"], b"2");
        // "b" and "c" went to L2
        assert_eq!(tiered.l2().gets.load(Ordering::SeqCst), 2);
    }
}
