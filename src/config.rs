//! Configuration

use std::time::Duration;

/// Configuration for the cache capability implementations
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries in the process-local (moka) cache
    pub l1_max_capacity: u64,
    /// Time-to-live for process-local entries; `None` keeps them until evicted
    pub l1_ttl: Option<Duration>,
    /// Redis pub/sub channel carrying cross-instance L1 invalidations
    pub invalidation_channel: String,
    /// Number of pooled Redis connections
    pub pool_size: usize,
    /// How long to wait for a pooled connection before reporting the pool exhausted
    pub pool_acquire_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_capacity: 10_000,
            l1_ttl: Some(Duration::from_secs(300)), // 5 minutes
            invalidation_channel: "recordcache:invalidate".to_owned(),
            pool_size: 8,
            pool_acquire_timeout: Duration::from_millis(500),
        }
    }
}

/// Behaviour switches for record reads
#[derive(Debug, Clone)]
pub struct AccessConfig {
    /// Treat cache faults on the read path as misses instead of failing the read
    pub fall_through_on_cache_fault: bool,
    /// Share one backend fetch between concurrent misses for the same key
    pub coalesce_reads: bool,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            fall_through_on_cache_fault: false,
            coalesce_reads: true,
        }
    }
}
