//! Running-average aggregates updated in place on the backend
//!
//! The update is a pure function handed to [`BackendStore::apply_atomic`], so
//! concurrent deltas against the same record are serialized by the backend
//! and none of them is lost.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::accessor::invalidate_task;
use crate::backend::{BackendStore, Document};
use crate::cache_client::CacheClient;
use crate::context::RequestContext;
use crate::error::RecordError;
use crate::fan_out::FanOutCoordinator;
use crate::keys::{KeyFormatter, PlainKeys, RecordKey};

const OPERATION: &str = "apply_delta";

/// Average value and sample count of one record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub avg: f64,
    pub count: u64,
}

impl AggregateSnapshot {
    /// Fold `delta_count` new samples summing to `delta_sum` into the snapshot
    pub fn apply(self, delta_sum: f64, delta_count: u32) -> Self {
        let count = self.count + u64::from(delta_count);
        if count == 0 {
            return self;
        }
        Self {
            avg: (self.avg * self.count as f64 + delta_sum) / count as f64,
            count,
        }
    }
}

pub struct AggregateUpdater<K, KF = PlainKeys> {
    cache: Arc<dyn CacheClient>,
    store: Arc<dyn BackendStore>,
    key_formatter: Arc<KF>,
    coordinator: FanOutCoordinator,
    avg_field: &'static str,
    count_field: &'static str,
    _key: PhantomData<fn(K)>,
}

impl<K, KF> Clone for AggregateUpdater<K, KF> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            store: Arc::clone(&self.store),
            key_formatter: Arc::clone(&self.key_formatter),
            coordinator: self.coordinator,
            avg_field: self.avg_field,
            count_field: self.count_field,
            _key: PhantomData,
        }
    }
}

impl<K, KF> AggregateUpdater<K, KF>
where
    K: RecordKey,
    KF: KeyFormatter<K>,
{
    /// Updater for documents carrying `avg_rating` and `num_rating`
    pub fn new(cache: Arc<dyn CacheClient>, store: Arc<dyn BackendStore>, key_formatter: KF) -> Self {
        Self {
            cache,
            store,
            key_formatter: Arc::new(key_formatter),
            coordinator: FanOutCoordinator::new(),
            avg_field: "avg_rating",
            count_field: "num_rating",
            _key: PhantomData,
        }
    }

    /// Use other document fields for the average and the count
    pub fn with_fields(mut self, avg_field: &'static str, count_field: &'static str) -> Self {
        self.avg_field = avg_field;
        self.count_field = count_field;
        self
    }

    /// Fold a delta into the record's aggregate.
    ///
    /// Returns the stored snapshot, or `None` when there is no record for
    /// `key`, in which case nothing is written.
    pub async fn apply_delta(
        &self,
        ctx: &RequestContext,
        key: &K,
        delta_sum: f64,
        delta_count: u32,
    ) -> Result<Option<AggregateSnapshot>, RecordError> {
        let id = self.key_formatter.document_id(key);
        info!(
            "REQUEST to update aggregate (req_id={}, key={}, sum={}, count={})",
            ctx.req_id, id, delta_sum, delta_count
        );

        if !delta_sum.is_finite() {
            warn!("Rejecting non-finite delta {} for key {}", delta_sum, id);
            return Err(RecordError::Serialization {
                key: id,
                operation: OPERATION,
                source: serde_json::Error::custom(format!(
                    "delta sum must be finite, got {delta_sum}"
                )),
            });
        }

        let (avg_field, count_field) = (self.avg_field, self.count_field);
        let update = move |doc: &Document| -> Result<Document, serde_json::Error> {
            let next = read_snapshot(doc, avg_field, count_field)?.apply(delta_sum, delta_count);
            write_snapshot(doc.clone(), avg_field, count_field, next)
        };

        let stored = match self.store.apply_atomic(&id, &update).await {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                debug!("No record for key {}; nothing to update", id);
                return Ok(None);
            }
            Err(e) => {
                error!("Failed to update aggregate for key {}: {}", id, e);
                return Err(RecordError::from_store(id, OPERATION, e));
            }
        };

        let snapshot = read_snapshot(&stored, avg_field, count_field).map_err(|source| {
            RecordError::Serialization {
                key: id.clone(),
                operation: OPERATION,
                source,
            }
        })?;

        let cache_key = self.key_formatter.format_key(key);
        let report = self
            .coordinator
            .run(ctx, vec![invalidate_task(Arc::clone(&self.cache), cache_key)])
            .await;
        if report.best_effort_failures > 0 {
            warn!("Failed to invalidate cached record {} (req_id={})", id, ctx.req_id);
        }

        info!(
            "OK (req_id={}, key={}, avg={}, count={})",
            ctx.req_id, id, snapshot.avg, snapshot.count
        );
        Ok(Some(snapshot))
    }
}

fn read_snapshot(
    doc: &Document,
    avg_field: &str,
    count_field: &str,
) -> Result<AggregateSnapshot, serde_json::Error> {
    let avg = doc
        .get(avg_field)
        .and_then(Value::as_f64)
        .ok_or_else(|| serde_json::Error::custom(format!("missing numeric field `{avg_field}`")))?;
    let count = doc
        .get(count_field)
        .and_then(Value::as_u64)
        .ok_or_else(|| serde_json::Error::custom(format!("missing count field `{count_field}`")))?;
    Ok(AggregateSnapshot { avg, count })
}

fn write_snapshot(
    mut doc: Document,
    avg_field: &str,
    count_field: &str,
    snapshot: AggregateSnapshot,
) -> Result<Document, serde_json::Error> {
    if !snapshot.avg.is_finite() {
        return Err(serde_json::Error::custom(format!(
            "average would become {}",
            snapshot.avg
        )));
    }
    let fields = doc
        .as_object_mut()
        .ok_or_else(|| serde_json::Error::custom("document is not an object"))?;
    fields.insert(avg_field.to_owned(), serde_json::to_value(snapshot.avg)?);
    fields.insert(count_field.to_owned(), Value::from(snapshot.count));
    Ok(doc)
}
