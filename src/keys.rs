//! Record key and value bounds, and key formatting for the cache and backend

use std::fmt::Display;
use std::hash::Hash;

use serde::{Serialize, de::DeserializeOwned};

/// Trait for types that can be cached and stored
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Trait for record key types (titles, numeric ids, ...)
pub trait RecordKey: Display + Hash + Eq + Clone + Send + Sync + 'static {}
impl<T> RecordKey for T where T: Display + Hash + Eq + Clone + Send + Sync + 'static {}

/// Trait for naming a record in the cache and in the backend store
pub trait KeyFormatter<K: Display>: Send + Sync + 'static {
    /// Build the cache key
    fn format_key(&self, key: &K) -> String;

    /// Build the backend document id
    fn document_id(&self, key: &K) -> String {
        key.to_string()
    }
}

/// Cache key and document id are both the key's display form
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainKeys;

impl<K: Display> KeyFormatter<K> for PlainKeys {
    fn format_key(&self, key: &K) -> String {
        key.to_string()
    }
}

/// Cache keys carry a fixed prefix, e.g. `"plot:"`, so several record
/// types can share one cache
#[derive(Debug, Clone, Copy)]
pub struct PrefixedKeys {
    pub prefix: &'static str,
}

impl PrefixedKeys {
    pub const fn new(prefix: &'static str) -> Self {
        Self { prefix }
    }
}

impl<K: Display> KeyFormatter<K> for PrefixedKeys {
    fn format_key(&self, key: &K) -> String {
        format!("{}{}", self.prefix, key)
    }
}
