//! Request coalescing for backend reads
//!
//! The first reader of a missing key registers an in-flight fetch; later
//! readers of the same key wait for its outcome instead of querying the
//! backend themselves.
//!
//! A write detaches the key's in-flight fetch. Readers arriving after that
//! start a fresh fetch, and the detached leader skips its cache backfill.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::Error as _;
use tokio::sync::watch;

use crate::backend::Document;
use crate::error::{RecordError, StoreError};

/// Why a shared fetch failed, as seen by waiters
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FetchFailure {
    /// The backend returned a document it could not decode
    Malformed(String),
    Unavailable(String),
}

impl FetchFailure {
    pub(crate) fn from_store(err: &StoreError) -> Self {
        match err {
            StoreError::Malformed(e) => Self::Malformed(e.to_string()),
            other => Self::Unavailable(other.to_string()),
        }
    }

    pub(crate) fn into_record_error(self, key: String, operation: &'static str) -> RecordError {
        match self {
            Self::Malformed(msg) => RecordError::Serialization {
                key,
                operation,
                source: serde_json::Error::custom(msg),
            },
            Self::Unavailable(msg) => RecordError::BackendUnavailable {
                key,
                operation,
                source: StoreError::unavailable(msg),
            },
        }
    }
}

/// Outcome shared with waiters
pub(crate) type SharedFetch = Result<Option<Document>, FetchFailure>;

type InFlightFetch = watch::Receiver<Option<SharedFetch>>;
type InFlightSender = watch::Sender<Option<SharedFetch>>;
type InFlightMap = Arc<Mutex<HashMap<String, Arc<Flight>>>>;

struct Flight {
    rx: InFlightFetch,
    detached: AtomicBool,
}

#[derive(Clone, Default)]
pub(crate) struct InFlight {
    fetches: InFlightMap,
}

pub(crate) enum Joined {
    /// This caller performs the fetch and must complete the guard
    Leader(InFlightGuard),
    /// Another caller is already fetching
    Waiter(InFlightFetch),
}

impl InFlight {
    pub(crate) fn join(&self, id: &str) -> Joined {
        let mut fetches = self.fetches.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(flight) = fetches.get(id) {
            return Joined::Waiter(flight.rx.clone());
        }

        let (tx, rx) = watch::channel(None);
        let flight = Arc::new(Flight {
            rx,
            detached: AtomicBool::new(false),
        });
        fetches.insert(id.to_owned(), Arc::clone(&flight));
        Joined::Leader(InFlightGuard {
            id: id.to_owned(),
            fetches: Arc::clone(&self.fetches),
            flight,
            tx: Some(tx),
        })
    }

    /// Stop sharing the current fetch of `id`, if any, with new readers
    pub(crate) fn detach(&self, id: &str) {
        let removed = self
            .fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(flight) = removed {
            flight.detached.store(true, Ordering::SeqCst);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Wait for the leader's outcome
pub(crate) async fn wait(mut rx: InFlightFetch) -> SharedFetch {
    loop {
        let current = rx.borrow().clone();
        if let Some(result) = current {
            return result;
        }
        if rx.changed().await.is_err() {
            return Err(FetchFailure::Unavailable(
                "In-flight fetch was cancelled".to_owned(),
            ));
        }
    }
}

/// Guard that ensures in-flight entries are cleaned up even on panic/cancel.
///
/// When dropped, removes the key from the in-flight map and notifies waiters
/// with an error if no result was sent.
pub(crate) struct InFlightGuard {
    id: String,
    fetches: InFlightMap,
    flight: Arc<Flight>,
    tx: Option<InFlightSender>,
}

impl InFlightGuard {
    /// Release waiters with a result. The guard stays registered until dropped.
    pub(crate) fn complete(&mut self, result: SharedFetch) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(result));
        }
    }

    /// Whether a write to the key happened since this fetch started
    pub(crate) fn is_detached(&self) -> bool {
        self.flight.detached.load(Ordering::SeqCst)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Err(FetchFailure::Unavailable(
                "Fetch was cancelled or panicked".to_owned(),
            ))));
        }

        let mut fetches = self.fetches.lock().unwrap_or_else(PoisonError::into_inner);
        // A detached key may already belong to a newer fetch.
        if fetches
            .get(&self.id)
            .is_some_and(|current| Arc::ptr_eq(current, &self.flight))
        {
            fetches.remove(&self.id);
        }
    }
}
