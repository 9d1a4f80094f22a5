//! recordcache - Cache-aside record access
//!
//! This library provides the storage access layer of a record service:
//! - Single-key reads and writes over an ephemeral cache and a durable backend
//! - Bulk reads with one cache round trip and one backend round trip
//! - Atomic running-average updates and append-only child indexes
//! - Concurrent write fan-out with fatal and best-effort tasks
//!
//! Caches and backends are pluggable through [`CacheClient`] and
//! [`BackendStore`]. Moka, Redis and a two-tier combination of both are
//! provided for the cache; [`MemoryStore`] is an in-process backend.

mod accessor;
mod aggregate;
mod backend;
mod bulk;
mod cache_client;
mod coalesce;
mod config;
mod context;
mod downstream;
mod error;
pub mod fan_out;
mod index;
mod keys;
mod pool;
mod redis_cache;
mod tiered_cache;

pub use accessor::{CacheAction, RecordAccessor};
pub use aggregate::{AggregateSnapshot, AggregateUpdater};
pub use backend::{BackendStore, Document, MemoryStore, UpdateFn, WriteMode};
pub use bulk::BulkReadResolver;
pub use cache_client::{CacheClient, MokaCacheClient};
pub use config::{AccessConfig, CacheConfig};
pub use context::RequestContext;
pub use downstream::{DownstreamCaller, Notification};
pub use error::{BoxError, CacheError, PoolError, RecordError, StoreError};
pub use fan_out::{Criticality, FanOut, FanOutCoordinator, FanOutReport, Task};
pub use index::{ChildIndex, ChildList, IndexEntry};
pub use keys::{Cacheable, KeyFormatter, PlainKeys, PrefixedKeys, RecordKey};
pub use pool::{Pool, Pooled};
pub use redis_cache::RedisCacheClient;
pub use tiered_cache::TieredCacheClient;

// Re-export async_trait for convenience
pub use async_trait::async_trait;
