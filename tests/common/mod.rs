//! Shared doubles for integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use recordcache::{
    BackendStore, BoxError, CacheClient, CacheError, Document, DownstreamCaller, MemoryStore,
    MokaCacheClient, RequestContext, StoreError, UpdateFn, WriteMode, async_trait,
};
use serde::de::Error as _;
use serde::{Deserialize, Serialize};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plot {
    pub plot_id: i64,
    pub plot: String,
}

impl Plot {
    pub fn new(plot_id: i64, plot: &str) -> Self {
        Self {
            plot_id,
            plot: plot.to_owned(),
        }
    }
}

fn outage() -> CacheError {
    CacheError::Other("simulated cache outage".into())
}

/// Moka-backed cache that counts calls and can be switched into an outage
#[derive(Default)]
pub struct FlakyCache {
    pub inner: MokaCacheClient,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
    pub gets: AtomicUsize,
    pub multi_gets: AtomicUsize,
    pub sets: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl FlakyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
            + self.multi_gets.load(Ordering::SeqCst)
            + self.sets.load(Ordering::SeqCst)
            + self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheClient for FlakyCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(outage());
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(outage());
        }
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(outage());
        }
        self.inner.delete(key).await
    }

    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, CacheError> {
        self.multi_gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(outage());
        }
        self.inner.multi_get(keys).await
    }
}

/// Memory store that counts calls, can fail, and can stall reads
#[derive(Default)]
pub struct CountingStore {
    pub inner: MemoryStore,
    pub fail: AtomicBool,
    /// Reads return a document that cannot be decoded
    pub malformed_reads: AtomicBool,
    /// Stall before taking the snapshot
    pub read_delay_ms: AtomicUsize,
    /// Stall after taking the snapshot, before answering
    pub post_read_delay_ms: AtomicUsize,
    pub gets: AtomicUsize,
    pub bulk_gets: AtomicUsize,
    pub puts: AtomicUsize,
    pub bulk_requests: Mutex<Vec<Vec<String>>>,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
            + self.bulk_gets.load(Ordering::SeqCst)
            + self.puts.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("simulated backend outage"));
        }
        Ok(())
    }

    async fn stall(delay: &AtomicUsize) {
        let delay = delay.load(Ordering::SeqCst) as u64;
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
    }
}

#[async_trait]
impl BackendStore for CountingStore {
    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Self::stall(&self.read_delay_ms).await;
        self.check()?;
        if self.malformed_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Malformed(serde_json::Error::custom(
                "invalid type: integer, expected a string",
            )));
        }
        let doc = self.inner.get(id).await?;
        Self::stall(&self.post_read_delay_ms).await;
        Ok(doc)
    }

    async fn put(&self, id: &str, doc: Document, mode: WriteMode) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.put(id, doc, mode).await
    }

    async fn bulk_get(&self, ids: &[String]) -> Result<HashMap<String, Document>, StoreError> {
        self.bulk_gets.fetch_add(1, Ordering::SeqCst);
        self.bulk_requests
            .lock()
            .unwrap()
            .push(ids.to_vec());
        self.check()?;
        self.inner.bulk_get(ids).await
    }

    async fn apply_atomic(
        &self,
        id: &str,
        update: UpdateFn<'_>,
    ) -> Result<Option<Document>, StoreError> {
        self.check()?;
        self.inner.apply_atomic(id, update).await
    }
}

/// One recorded downstream invocation
#[derive(Debug, Clone)]
pub struct Invocation {
    pub service: String,
    pub payload: Document,
    pub carrier: std::collections::BTreeMap<String, String>,
}

/// Downstream caller that records invocations and fails chosen services
#[derive(Default)]
pub struct RecordingDownstream {
    pub calls: Mutex<Vec<Invocation>>,
    pub failing: Mutex<Vec<String>>,
}

impl RecordingDownstream {
    pub fn failing_for(services: &[&str]) -> Self {
        Self {
            failing: Mutex::new(services.iter().map(|s| (*s).to_owned()).collect()),
            ..Default::default()
        }
    }

    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|call| call.service.clone())
            .collect();
        services.sort();
        services
    }
}

#[async_trait]
impl DownstreamCaller for RecordingDownstream {
    async fn invoke(
        &self,
        service: &str,
        payload: &Document,
        ctx: &RequestContext,
    ) -> Result<(), BoxError> {
        self.calls.lock().unwrap().push(Invocation {
            service: service.to_owned(),
            payload: payload.clone(),
            carrier: ctx.carrier.clone(),
        });
        if self.failing.lock().unwrap().iter().any(|s| s == service) {
            return Err(format!("{service} rejected the request").into());
        }
        Ok(())
    }
}

pub fn fixtures() -> (Arc<FlakyCache>, Arc<CountingStore>) {
    init_tracing();
    (Arc::new(FlakyCache::new()), Arc::new(CountingStore::new()))
}
