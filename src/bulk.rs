//! Batch resolution of many keys at once
//!
//! One cache multi-get, one backend bulk fetch for whatever the cache did
//! not have, a best-effort backfill of the fetched records, and reassembly in
//! input order.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::accessor::decode_document;
use crate::backend::BackendStore;
use crate::cache_client::CacheClient;
use crate::config::AccessConfig;
use crate::context::RequestContext;
use crate::error::RecordError;
use crate::fan_out::{FanOutCoordinator, Task};
use crate::keys::{Cacheable, KeyFormatter, PlainKeys, RecordKey};

const OPERATION: &str = "resolve_many";

pub struct BulkReadResolver<K, V, KF = PlainKeys> {
    cache: Arc<dyn CacheClient>,
    store: Arc<dyn BackendStore>,
    key_formatter: Arc<KF>,
    coordinator: FanOutCoordinator,
    config: AccessConfig,
    _record: PhantomData<fn(K) -> V>,
}

impl<K, V, KF> Clone for BulkReadResolver<K, V, KF> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            store: Arc::clone(&self.store),
            key_formatter: Arc::clone(&self.key_formatter),
            coordinator: self.coordinator,
            config: self.config.clone(),
            _record: PhantomData,
        }
    }
}

impl<K, V, KF> BulkReadResolver<K, V, KF>
where
    K: RecordKey,
    V: Cacheable,
    KF: KeyFormatter<K>,
{
    pub fn new(cache: Arc<dyn CacheClient>, store: Arc<dyn BackendStore>, key_formatter: KF) -> Self {
        Self {
            cache,
            store,
            key_formatter: Arc::new(key_formatter),
            coordinator: FanOutCoordinator::new(),
            config: AccessConfig::default(),
            _record: PhantomData,
        }
    }

    pub fn with_config(mut self, config: AccessConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolve `keys` in order, substituting `placeholder` for keys found in
    /// neither the cache nor the backend
    pub async fn resolve_many(
        &self,
        ctx: &RequestContext,
        keys: &[K],
        placeholder: &V,
    ) -> Result<Vec<V>, RecordError> {
        Ok(self
            .resolve_many_partial(ctx, keys)
            .await?
            .into_iter()
            .map(|value| value.unwrap_or_else(|| placeholder.clone()))
            .collect())
    }

    /// Resolve `keys` in order; `None` marks keys found in neither layer
    pub async fn resolve_many_partial(
        &self,
        ctx: &RequestContext,
        keys: &[K],
    ) -> Result<Vec<Option<V>>, RecordError> {
        info!(
            "REQUEST to read records (req_id={}, number of keys={})",
            ctx.req_id,
            keys.len()
        );

        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::with_capacity(keys.len());
        if let Some(dup) = keys.iter().find(|key| !seen.insert(*key)) {
            return Err(RecordError::DuplicateInputKey {
                key: self.key_formatter.document_id(dup),
            });
        }

        let cache_keys: Vec<String> = keys
            .iter()
            .map(|key| self.key_formatter.format_key(key))
            .collect();
        let ids: Vec<String> = keys
            .iter()
            .map(|key| self.key_formatter.document_id(key))
            .collect();

        let mut resolved: Vec<Option<V>> = self.read_cached(&cache_keys, &ids).await?;

        let missing: Vec<usize> = (0..keys.len()).filter(|&i| resolved[i].is_none()).collect();
        if missing.is_empty() {
            debug!("All {} keys found in cache", keys.len());
            return Ok(resolved);
        }

        let missing_ids: Vec<String> = missing.iter().map(|&i| ids[i].clone()).collect();
        let docs = self.store.bulk_get(&missing_ids).await.map_err(|e| {
            error!("Failed to bulk fetch {} records from backend: {}", missing_ids.len(), e);
            RecordError::from_store(bulk_label(&missing_ids), OPERATION, e)
        })?;
        debug!(
            "Backend returned {} of {} missing records",
            docs.len(),
            missing_ids.len()
        );

        let mut fetched = Vec::with_capacity(docs.len());
        let mut backfill = Vec::with_capacity(docs.len());
        for &i in &missing {
            let Some(doc) = docs.get(&ids[i]) else {
                continue;
            };
            let value: V = decode_document(&ids[i], OPERATION, doc.clone())?;
            match serde_json::to_vec(&value) {
                Ok(bytes) => backfill.push((cache_keys[i].clone(), bytes)),
                Err(e) => warn!("Skipping cache backfill for {}: {}", ids[i], e),
            }
            fetched.push((i, value));
        }

        let backfill_run = if backfill.is_empty() {
            None
        } else {
            Some(
                self.coordinator
                    .launch(ctx, vec![backfill_task(Arc::clone(&self.cache), backfill)]),
            )
        };

        for (i, value) in fetched {
            resolved[i] = Some(value);
        }

        let unresolved = resolved.iter().filter(|value| value.is_none()).count();
        if unresolved > 0 {
            warn!(
                "Return set incomplete: {} of {} keys found in neither cache nor backend",
                unresolved,
                keys.len()
            );
        }

        if let Some(run) = backfill_run {
            let report = run.join().await;
            if report.best_effort_failures > 0 {
                warn!("Failed to set records to cache (req_id={})", ctx.req_id);
            }
        }

        info!(
            "OK (req_id={}, number of keys={})",
            ctx.req_id,
            keys.len()
        );
        Ok(resolved)
    }

    async fn read_cached(
        &self,
        cache_keys: &[String],
        ids: &[String],
    ) -> Result<Vec<Option<V>>, RecordError> {
        let mut resolved: Vec<Option<V>> = (0..cache_keys.len()).map(|_| None).collect();

        let cached = match self.cache.multi_get(cache_keys).await {
            Ok(cached) => cached,
            Err(e) if self.config.fall_through_on_cache_fault => {
                warn!("Cache multi-get failed ({}). Falling back to backend.", e);
                return Ok(resolved);
            }
            Err(source) => {
                error!("Cache multi-get failed: {}", source);
                return Err(RecordError::CacheUnavailable {
                    key: bulk_label(ids),
                    operation: OPERATION,
                    source,
                });
            }
        };

        for (slot, cache_key) in resolved.iter_mut().zip(cache_keys) {
            let Some(bytes) = cached.get(cache_key) else {
                continue;
            };
            match serde_json::from_slice::<V>(bytes) {
                Ok(value) => {
                    debug!("Record {} found in cache", cache_key);
                    *slot = Some(value);
                }
                Err(e) => warn!(
                    "Failed to deserialize cached value for key {}: {}. Treating as a miss.",
                    cache_key, e
                ),
            }
        }

        Ok(resolved)
    }
}

fn backfill_task(cache: Arc<dyn CacheClient>, entries: Vec<(String, Vec<u8>)>) -> Task {
    Task::best_effort("cache-backfill", async move {
        let total = entries.len();
        let mut failed = 0;
        for (cache_key, bytes) in &entries {
            if let Err(e) = cache.set(cache_key, bytes).await {
                warn!("Failed to set record {} to cache: {}", cache_key, e);
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(format!("{failed} of {total} cache writes failed").into());
        }
        Ok(())
    })
}

fn bulk_label(ids: &[String]) -> String {
    format!("[{}]", ids.join(","))
}
