//! Per-parent index of child records, e.g. the reviews of a movie
//!
//! Appends never read-then-write: an existing index is extended through
//! [`BackendStore::apply_atomic`], and the first entry creates the index with
//! [`WriteMode::CreateIfAbsent`]. Losing that creation race just means the
//! index now exists, so the append goes back to the atomic path.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::accessor::{RecordAccessor, invalidate_task};
use crate::backend::{BackendStore, Document, WriteMode};
use crate::cache_client::CacheClient;
use crate::context::RequestContext;
use crate::error::{RecordError, StoreError};
use crate::keys::{KeyFormatter, PlainKeys, RecordKey};

const OPERATION: &str = "append";

/// Creation races tolerated before an append gives up
const MAX_APPEND_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub child_id: i64,
    pub timestamp: i64,
}

/// Stored form of one parent's index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildList {
    pub parent: String,
    #[serde(default)]
    pub children: Vec<IndexEntry>,
}

pub struct ChildIndex<K, KF = PlainKeys> {
    records: RecordAccessor<K, ChildList, KF>,
}

impl<K, KF> Clone for ChildIndex<K, KF> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
        }
    }
}

impl<K, KF> ChildIndex<K, KF>
where
    K: RecordKey,
    KF: KeyFormatter<K>,
{
    pub fn new(cache: Arc<dyn CacheClient>, store: Arc<dyn BackendStore>, key_formatter: KF) -> Self {
        Self {
            records: RecordAccessor::new(cache, store, key_formatter),
        }
    }

    /// Append `entry` to the index of `parent`, creating the index if needed
    pub async fn append(
        &self,
        ctx: &RequestContext,
        parent: &K,
        entry: IndexEntry,
    ) -> Result<(), RecordError> {
        let id = self.records.key_formatter().document_id(parent);
        info!(
            "REQUEST to index child (req_id={}, parent={}, child_id={})",
            ctx.req_id, id, entry.child_id
        );

        self.append_stored(&id, entry).await?;
        self.records.detach_in_flight(&id);

        let cache_key = self.records.key_formatter().format_key(parent);
        let report = self
            .records
            .coordinator()
            .run(
                ctx,
                vec![invalidate_task(Arc::clone(self.records.cache()), cache_key)],
            )
            .await;
        if report.best_effort_failures > 0 {
            warn!("Failed to invalidate cached index {} (req_id={})", id, ctx.req_id);
        }

        info!("OK (req_id={}, parent={})", ctx.req_id, id);
        Ok(())
    }

    /// Child ids of `parent` in insertion order; empty when nothing was indexed
    pub async fn load(&self, ctx: &RequestContext, parent: &K) -> Result<Vec<i64>, RecordError> {
        Ok(self
            .entries(ctx, parent)
            .await?
            .into_iter()
            .map(|entry| entry.child_id)
            .collect())
    }

    /// Full entries of `parent` in insertion order
    pub async fn entries(
        &self,
        ctx: &RequestContext,
        parent: &K,
    ) -> Result<Vec<IndexEntry>, RecordError> {
        match self.records.read(ctx, parent).await {
            Ok(list) => Ok(list.children),
            Err(RecordError::RecordNotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn append_stored(&self, id: &str, entry: IndexEntry) -> Result<(), RecordError> {
        let store = self.records.store();
        let push = move |doc: &Document| push_entry(doc, entry);

        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            match store.apply_atomic(id, &push).await {
                Ok(Some(_)) => return Ok(()),
                Ok(None) => debug!("No index for {} yet, creating it", id),
                Err(e) => {
                    error!("Failed to append to index {}: {}", id, e);
                    return Err(RecordError::from_store(id.to_owned(), OPERATION, e));
                }
            }

            let first = ChildList {
                parent: id.to_owned(),
                children: vec![entry],
            };
            let doc = serde_json::to_value(&first).map_err(|source| RecordError::Serialization {
                key: id.to_owned(),
                operation: OPERATION,
                source,
            })?;

            match store.put(id, doc, WriteMode::CreateIfAbsent).await {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict) => debug!(
                    "Index {} was created concurrently (attempt {}), appending instead",
                    id, attempt
                ),
                Err(e) => {
                    error!("Failed to create index {}: {}", id, e);
                    return Err(RecordError::from_store(id.to_owned(), OPERATION, e));
                }
            }
        }

        Err(RecordError::BackendUnavailable {
            key: id.to_owned(),
            operation: OPERATION,
            source: StoreError::unavailable(format!(
                "index neither appendable nor creatable after {MAX_APPEND_ATTEMPTS} attempts"
            )),
        })
    }
}

fn push_entry(doc: &Document, entry: IndexEntry) -> Result<Document, serde_json::Error> {
    let mut list: ChildList = serde_json::from_value(doc.clone())?;
    list.children.push(entry);
    serde_json::to_value(list)
}
