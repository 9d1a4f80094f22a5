//! Single-key cache-aside access
//!
//! Reads consult the cache, fall back to the backend on a miss and repopulate
//! the cache before returning. Writes go to the backend first; the cache
//! update and any dependent-service notifications then run concurrently
//! through the [`FanOutCoordinator`].

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::backend::{BackendStore, Document, WriteMode};
use crate::cache_client::CacheClient;
use crate::coalesce::{self, FetchFailure, InFlight, InFlightGuard, Joined};
use crate::config::AccessConfig;
use crate::context::RequestContext;
use crate::downstream::{DownstreamCaller, Notification};
use crate::error::{RecordError, StoreError};
use crate::fan_out::{FanOutCoordinator, Task};
use crate::keys::{Cacheable, KeyFormatter, PlainKeys, RecordKey};

/// What the write path does to the cache once the backend accepted a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    /// Store the written record under its cache key
    Populate,
    /// Delete the cache entry so the next read goes to the backend
    Invalidate,
}

pub struct RecordAccessor<K, V, KF = PlainKeys> {
    cache: Arc<dyn CacheClient>,
    store: Arc<dyn BackendStore>,
    downstream: Option<Arc<dyn DownstreamCaller>>,
    key_formatter: Arc<KF>,
    coordinator: FanOutCoordinator,
    in_flight: InFlight,
    config: AccessConfig,
    _record: PhantomData<fn(K) -> V>,
}

impl<K, V, KF> Clone for RecordAccessor<K, V, KF> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            store: Arc::clone(&self.store),
            downstream: self.downstream.clone(),
            key_formatter: Arc::clone(&self.key_formatter),
            coordinator: self.coordinator,
            in_flight: self.in_flight.clone(),
            config: self.config.clone(),
            _record: PhantomData,
        }
    }
}

impl<K, V, KF> RecordAccessor<K, V, KF>
where
    K: RecordKey,
    V: Cacheable,
    KF: KeyFormatter<K>,
{
    pub fn new(cache: Arc<dyn CacheClient>, store: Arc<dyn BackendStore>, key_formatter: KF) -> Self {
        Self {
            cache,
            store,
            downstream: None,
            key_formatter: Arc::new(key_formatter),
            coordinator: FanOutCoordinator::new(),
            in_flight: InFlight::default(),
            config: AccessConfig::default(),
            _record: PhantomData,
        }
    }

    /// Service client used for write notifications
    pub fn with_downstream(mut self, downstream: Arc<dyn DownstreamCaller>) -> Self {
        self.downstream = Some(downstream);
        self
    }

    pub fn with_config(mut self, config: AccessConfig) -> Self {
        self.config = config;
        self
    }

    pub(crate) fn key_formatter(&self) -> &KF {
        &self.key_formatter
    }

    pub(crate) fn cache(&self) -> &Arc<dyn CacheClient> {
        &self.cache
    }

    pub(crate) fn store(&self) -> &Arc<dyn BackendStore> {
        &self.store
    }

    pub(crate) fn coordinator(&self) -> FanOutCoordinator {
        self.coordinator
    }

    /// Keep reads that start from now on off any fetch begun before a write
    pub(crate) fn detach_in_flight(&self, id: &str) {
        self.in_flight.detach(id);
    }

    /// Read one record, cache first
    pub async fn read(&self, ctx: &RequestContext, key: &K) -> Result<V, RecordError> {
        let cache_key = self.key_formatter.format_key(key);
        let id = self.key_formatter.document_id(key);
        debug!("REQUEST to read record (req_id={}, key={})", ctx.req_id, id);

        if let Some(value) = self.read_cached(&cache_key, &id).await? {
            return Ok(value);
        }

        let doc = if self.config.coalesce_reads {
            self.fetch_coalesced(&cache_key, &id).await?
        } else {
            self.fetch_and_backfill(&cache_key, &id, None).await?
        };

        match doc {
            Some(doc) => decode_document(&id, "read", doc),
            None => {
                debug!("Record not found for key: {}", id);
                Err(RecordError::RecordNotFound { key: id })
            }
        }
    }

    /// Write one record to the backend, then update the cache and notify
    /// dependent services concurrently.
    ///
    /// A failed notification fails the call even though the backend write is
    /// already durable. Retrying is safe for [`WriteMode::Overwrite`]; for
    /// [`WriteMode::CreateIfAbsent`] a retry reports `DuplicateKeyConflict`
    /// against the earlier attempt's own document.
    pub async fn write(
        &self,
        ctx: &RequestContext,
        key: &K,
        record: &V,
        mode: WriteMode,
        cache_action: CacheAction,
        notify: Vec<Notification>,
    ) -> Result<(), RecordError> {
        let cache_key = self.key_formatter.format_key(key);
        let id = self.key_formatter.document_id(key);
        info!(
            "REQUEST to write record (req_id={}, key={}, mode={:?})",
            ctx.req_id, id, mode
        );

        let doc = serde_json::to_value(record).map_err(|source| RecordError::Serialization {
            key: id.clone(),
            operation: "write",
            source,
        })?;

        match self.store.put(&id, doc, mode).await {
            Ok(()) => {
                debug!("Wrote record {} to backend", id);
                self.in_flight.detach(&id);
            }
            Err(StoreError::Conflict) if mode == WriteMode::CreateIfAbsent => {
                warn!("Record {} already exists in backend", id);
                return Err(RecordError::DuplicateKeyConflict { key: id });
            }
            Err(e) => {
                error!("Failed to write record {} to backend: {}", id, e);
                return Err(RecordError::from_store(id, "write", e));
            }
        }

        let mut tasks = Vec::with_capacity(notify.len() + 1);
        tasks.push(self.cache_task(cache_key, record, cache_action));
        tasks.extend(notify.into_iter().map(|n| self.notify_task(ctx, n)));

        self.coordinator.run(ctx, tasks).await.into_result(id.as_str())?;

        info!("OK (req_id={}, key={})", ctx.req_id, id);
        Ok(())
    }

    async fn read_cached(&self, cache_key: &str, id: &str) -> Result<Option<V>, RecordError> {
        let bytes = match self.cache.get(cache_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("Cache miss for key: {}", cache_key);
                return Ok(None);
            }
            Err(e) if self.config.fall_through_on_cache_fault => {
                warn!(
                    "Cache GET error for key {} ({}). Falling back to backend.",
                    cache_key, e
                );
                return Ok(None);
            }
            Err(source) => {
                error!("Cache GET error for key {}: {}", cache_key, source);
                return Err(RecordError::CacheUnavailable {
                    key: id.to_owned(),
                    operation: "read",
                    source,
                });
            }
        };

        match serde_json::from_slice::<V>(&bytes) {
            Ok(value) => {
                debug!("Cache hit for key: {}", cache_key);
                Ok(Some(value))
            }
            Err(e) => {
                warn!(
                    "Failed to deserialize cached value for key {}: {}. Deleting corrupt entry.",
                    cache_key, e
                );
                if let Err(del_err) = self.cache.delete(cache_key).await {
                    warn!("Failed to delete corrupt cache entry {}: {}", cache_key, del_err);
                }
                Ok(None)
            }
        }
    }

    async fn fetch_coalesced(
        &self,
        cache_key: &str,
        id: &str,
    ) -> Result<Option<Document>, RecordError> {
        match self.in_flight.join(id) {
            Joined::Leader(guard) => self.fetch_and_backfill(cache_key, id, Some(guard)).await,
            Joined::Waiter(rx) => {
                debug!("Waiting for in-flight backend fetch for key: {}", id);
                coalesce::wait(rx)
                    .await
                    .map_err(|failure| failure.into_record_error(id.to_owned(), "read"))
            }
        }
    }

    /// Fetch from the backend and repopulate the cache. Waiters registered on
    /// `guard` are released as soon as the backend answered.
    async fn fetch_and_backfill(
        &self,
        cache_key: &str,
        id: &str,
        mut guard: Option<InFlightGuard>,
    ) -> Result<Option<Document>, RecordError> {
        let fetched = self.store.get(id).await;

        if let Some(guard) = guard.as_mut() {
            guard.complete(match &fetched {
                Ok(doc) => Ok(doc.clone()),
                Err(e) => Err(FetchFailure::from_store(e)),
            });
        }

        let doc = match fetched {
            Ok(Some(doc)) => doc,
            Ok(None) => return Ok(None),
            Err(e) => {
                error!("Backend error for key {}: {}", id, e);
                return Err(RecordError::from_store(id.to_owned(), "read", e));
            }
        };

        debug!("Cache miss - fetched from backend for key: {}", id);

        let written_meanwhile = |guard: &Option<InFlightGuard>| {
            guard.as_ref().is_some_and(InFlightGuard::is_detached)
        };
        if written_meanwhile(&guard) {
            debug!("Record {} was written during the fetch; skipping cache backfill", id);
            return Ok(Some(doc));
        }

        // Backfill is best effort: the response is decided by the backend read.
        match decode_document::<V>(id, "read", doc.clone()).and_then(|value| encode(id, &value)) {
            Ok(bytes) => {
                if let Err(e) = self.cache.set(cache_key, &bytes).await {
                    warn!("Failed to set record {} to cache: {}. Continuing.", cache_key, e);
                }
            }
            Err(e) => debug!("Skipping cache backfill for {}: {}", id, e),
        }

        // The write may have invalidated the cache while our set was in flight.
        if written_meanwhile(&guard) {
            debug!("Record {} was written during backfill; dropping cached copy", id);
            if let Err(e) = self.cache.delete(cache_key).await {
                warn!("Failed to drop stale cache entry {}: {}", cache_key, e);
            }
        }

        Ok(Some(doc))
    }

    fn cache_task(&self, cache_key: String, record: &V, action: CacheAction) -> Task {
        let cache = Arc::clone(&self.cache);
        match action {
            CacheAction::Populate => {
                let bytes = serde_json::to_vec(record);
                Task::best_effort("cache-populate", async move {
                    cache.set(&cache_key, &bytes?).await?;
                    Ok(())
                })
            }
            CacheAction::Invalidate => invalidate_task(cache, cache_key),
        }
    }

    fn notify_task(&self, ctx: &RequestContext, notification: Notification) -> Task {
        let downstream = self.downstream.clone();
        let ctx = ctx.clone();
        Task::fatal(format!("notify:{}", notification.service), async move {
            let downstream = downstream.ok_or("no downstream caller configured")?;
            downstream
                .invoke(&notification.service, &notification.payload, &ctx)
                .await
        })
    }
}

/// Best-effort deletion of one cache entry
pub(crate) fn invalidate_task(cache: Arc<dyn CacheClient>, cache_key: String) -> Task {
    Task::best_effort("cache-invalidate", async move {
        cache.delete(&cache_key).await?;
        Ok(())
    })
}

pub(crate) fn decode_document<V: Cacheable>(
    id: &str,
    operation: &'static str,
    doc: Document,
) -> Result<V, RecordError> {
    serde_json::from_value(doc).map_err(|source| RecordError::Serialization {
        key: id.to_owned(),
        operation,
        source,
    })
}

pub(crate) fn encode<V: Cacheable>(id: &str, value: &V) -> Result<Vec<u8>, RecordError> {
    serde_json::to_vec(value).map_err(|source| RecordError::Serialization {
        key: id.to_owned(),
        operation: "encode",
        source,
    })
}
