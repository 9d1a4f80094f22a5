//! Durable backend store capability
//!
//! The backend is the only source of truth. Implementations differ in how
//! they arbitrate concurrent writers, but all of them must make
//! [`WriteMode::CreateIfAbsent`] atomic per document id and must apply
//! [`BackendStore::apply_atomic`] against the document version it read.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::error::StoreError;

/// A stored document
pub type Document = serde_json::Value;

/// Pure update applied by [`BackendStore::apply_atomic`]; may run more than once
pub type UpdateFn<'a> = &'a (dyn Fn(&Document) -> Result<Document, serde_json::Error> + Send + Sync);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteMode {
    /// Idempotent upsert
    Overwrite,
    /// First writer wins; later writers get [`StoreError::Conflict`]
    CreateIfAbsent,
}

#[async_trait]
pub trait BackendStore: Send + Sync + 'static {
    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError>;

    async fn put(&self, id: &str, doc: Document, mode: WriteMode) -> Result<(), StoreError>;

    /// Fetch several documents. Ids absent from the result were not found.
    async fn bulk_get(&self, ids: &[String]) -> Result<HashMap<String, Document>, StoreError>;

    /// Read-modify-write one document atomically.
    ///
    /// Returns the stored result, or `None` when no document exists for `id`.
    async fn apply_atomic(
        &self,
        id: &str,
        update: UpdateFn<'_>,
    ) -> Result<Option<Document>, StoreError>;
}

struct Revisioned {
    rev: u64,
    doc: Document,
}

/// In-process backend keeping a revision per document.
///
/// `apply_atomic` is optimistic: it reads a document and its revision,
/// computes the update without holding the lock, then commits only if the
/// revision is unchanged, retrying otherwise.
pub struct MemoryStore {
    docs: Mutex<HashMap<String, Revisioned>>,
    max_update_attempts: u32,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_update_attempts(16)
    }

    pub fn with_update_attempts(max_update_attempts: u32) -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
            max_update_attempts: max_update_attempts.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current revision of a document; bumped by every successful write
    pub fn revision(&self, id: &str) -> Option<u64> {
        self.lock().get(id).map(|entry| entry.rev)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Revisioned>> {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, id: &str) -> Option<(u64, Document)> {
        self.lock()
            .get(id)
            .map(|entry| (entry.rev, entry.doc.clone()))
    }
}

#[async_trait]
impl BackendStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.snapshot(id).map(|(_, doc)| doc))
    }

    async fn put(&self, id: &str, doc: Document, mode: WriteMode) -> Result<(), StoreError> {
        let mut docs = self.lock();
        match (docs.entry(id.to_owned()), mode) {
            (Entry::Occupied(_), WriteMode::CreateIfAbsent) => Err(StoreError::Conflict),
            (Entry::Occupied(mut occupied), WriteMode::Overwrite) => {
                let entry = occupied.get_mut();
                entry.rev += 1;
                entry.doc = doc;
                Ok(())
            }
            (Entry::Vacant(vacant), _) => {
                vacant.insert(Revisioned { rev: 1, doc });
                Ok(())
            }
        }
    }

    async fn bulk_get(&self, ids: &[String]) -> Result<HashMap<String, Document>, StoreError> {
        let docs = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| docs.get(id).map(|entry| (id.clone(), entry.doc.clone())))
            .collect())
    }

    async fn apply_atomic(
        &self,
        id: &str,
        update: UpdateFn<'_>,
    ) -> Result<Option<Document>, StoreError> {
        for attempt in 1..=self.max_update_attempts {
            let Some((rev, current)) = self.snapshot(id) else {
                return Ok(None);
            };

            let updated = update(&current)?;

            let mut docs = self.lock();
            match docs.get_mut(id) {
                Some(entry) if entry.rev == rev => {
                    entry.rev += 1;
                    entry.doc = updated.clone();
                    return Ok(Some(updated));
                }
                Some(_) => {
                    debug!(
                        "MemoryStore: revision of {} moved during update (attempt {}), retrying",
                        id, attempt
                    );
                }
                None => return Ok(None),
            }
        }

        Err(StoreError::unavailable(format!(
            "update of {} abandoned after {} conflicting attempts",
            id, self.max_update_attempts
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn create_if_absent_rejects_second_writer() {
        let store = MemoryStore::new();
        store
            .put("Heat", json!({"movie_id": "m1"}), WriteMode::CreateIfAbsent)
            .await
            .unwrap();

        let second = store
            .put("Heat", json!({"movie_id": "m2"}), WriteMode::CreateIfAbsent)
            .await;
        assert!(matches!(second, Err(StoreError::Conflict)));
        assert_eq!(
            store.get("Heat").await.unwrap(),
            Some(json!({"movie_id": "m1"}))
        );
    }

    #[tokio::test]
    async fn overwrite_bumps_revision() {
        let store = MemoryStore::new();
        store.put("p1", json!(1), WriteMode::Overwrite).await.unwrap();
        store.put("p1", json!(2), WriteMode::Overwrite).await.unwrap();
        assert_eq!(store.revision("p1"), Some(2));
        assert_eq!(store.get("p1").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn bulk_get_omits_missing_ids() {
        let store = MemoryStore::new();
        store.put("1", json!("a"), WriteMode::Overwrite).await.unwrap();

        let ids = vec!["1".to_owned(), "2".to_owned()];
        let found = store.bulk_get(&ids).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["1"], json!("a"));
    }

    #[tokio::test]
    async fn apply_atomic_on_missing_document_is_none() {
        let store = MemoryStore::new();
        let result = store.apply_atomic("nope", &|doc| Ok(doc.clone())).await;
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn apply_atomic_reports_malformed_documents() {
        let store = MemoryStore::new();
        store.put("m1", json!({"n": "x"}), WriteMode::Overwrite).await.unwrap();

        let result = store
            .apply_atomic("m1", &|doc| {
                let n: i64 = serde_json::from_value(doc["n"].clone())?;
                Ok(json!({ "n": n + 1 }))
            })
            .await;
        assert!(matches!(result, Err(StoreError::Malformed(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_atomic_updates_are_not_lost() {
        let store = Arc::new(MemoryStore::with_update_attempts(1_000));
        store.put("c", json!({"n": 0}), WriteMode::Overwrite).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .apply_atomic("c", &|doc| {
                        let n = doc["n"].as_i64().unwrap_or_default();
                        Ok(json!({ "n": n + 1 }))
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get("c").await.unwrap(), Some(json!({"n": 32})));
    }
}
