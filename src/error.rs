//! Error types
//!
//! Capability-level errors (`CacheError`, `StoreError`, `PoolError`) are what the
//! cache, backend and pool implementations return. `RecordError` is the
//! caller-facing taxonomy, carrying the key and operation that failed.

use std::time::Duration;

use redis::RedisError;

/// Boxed error used at the pluggable seams (backends, downstream services)
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure to acquire a pooled handle
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool '{pool}' exhausted: no handle released within {waited:?}")]
    Exhausted { pool: &'static str, waited: Duration },

    #[error("pool '{pool}' is closed")]
    Closed { pool: &'static str },
}

/// Cache capability errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error(transparent)]
    PoolExhausted(#[from] PoolError),

    #[error("Cache error: {0}")]
    Other(BoxError),
}

/// Backend store capability errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A create-if-absent write found an existing document
    #[error("document already exists")]
    Conflict,

    /// The stored document could not be read or updated in the expected shape
    #[error("malformed document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Unavailable(BoxError),
}

impl StoreError {
    pub fn unavailable<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Unavailable(err.into())
    }
}

/// Errors surfaced to callers of the record access layer
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("cache unavailable during {operation} (key={key}): {source}")]
    CacheUnavailable {
        key: String,
        operation: &'static str,
        #[source]
        source: CacheError,
    },

    #[error("backend unavailable during {operation} (key={key}): {source}")]
    BackendUnavailable {
        key: String,
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("record not found (key={key})")]
    RecordNotFound { key: String },

    #[error("record already exists (key={key})")]
    DuplicateKeyConflict { key: String },

    #[error("duplicate key in bulk request (key={key})")]
    DuplicateInputKey { key: String },

    #[error("dependent task '{task}' failed after write (key={key}): {source}")]
    DownstreamCallFailed {
        key: String,
        task: String,
        #[source]
        source: BoxError,
    },

    #[error("malformed payload during {operation} (key={key}): {source}")]
    Serialization {
        key: String,
        operation: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl RecordError {
    /// Key the failing operation was working on
    pub fn key(&self) -> &str {
        match self {
            Self::CacheUnavailable { key, .. }
            | Self::BackendUnavailable { key, .. }
            | Self::RecordNotFound { key }
            | Self::DuplicateKeyConflict { key }
            | Self::DuplicateInputKey { key }
            | Self::DownstreamCallFailed { key, .. }
            | Self::Serialization { key, .. } => key,
        }
    }

    /// Maps a backend failure, routing malformed documents to `Serialization`
    pub(crate) fn from_store(key: String, operation: &'static str, err: StoreError) -> Self {
        match err {
            StoreError::Malformed(source) => Self::Serialization {
                key,
                operation,
                source,
            },
            other => Self::BackendUnavailable {
                key,
                operation,
                source: other,
            },
        }
    }
}
