//! Bounded pool of reusable handles
//!
//! Handles are checked out with [`Pool::acquire`] and returned when the
//! [`Pooled`] guard drops, on every exit path. Waiting is bounded by the
//! pool's acquire timeout; running out of time is a typed error.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::warn;

use crate::error::PoolError;

pub struct Pool<T> {
    name: &'static str,
    idle: Mutex<Vec<T>>,
    permits: Semaphore,
    acquire_timeout: Duration,
}

impl<T> Pool<T> {
    pub fn new(name: &'static str, handles: Vec<T>, acquire_timeout: Duration) -> Self {
        let permits = Semaphore::new(handles.len());
        Self {
            name,
            idle: Mutex::new(handles),
            permits,
            acquire_timeout,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of handles currently checked in
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Check out a handle, waiting at most the configured timeout
    pub async fn acquire(&self) -> Result<Pooled<'_, T>, PoolError> {
        let permit = match tokio::time::timeout(self.acquire_timeout, self.permits.acquire()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed { pool: self.name }),
            Err(_) => {
                warn!(
                    "Pool '{}': no handle available after {:?}",
                    self.name, self.acquire_timeout
                );
                return Err(PoolError::Exhausted {
                    pool: self.name,
                    waited: self.acquire_timeout,
                });
            }
        };

        // A held permit guarantees an idle handle.
        let handle = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or(PoolError::Closed { pool: self.name })?;

        Ok(Pooled {
            handle: Some(handle),
            pool: self,
            _permit: permit,
        })
    }

    /// Reject all pending and future acquisitions
    pub fn close(&self) {
        self.permits.close();
    }

    fn release(&self, handle: T) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }
}

/// A checked-out handle; returned to its pool on drop
pub struct Pooled<'a, T> {
    handle: Option<T>,
    pool: &'a Pool<T>,
    // Dropped after `Drop::drop` has put the handle back.
    _permit: SemaphorePermit<'a>,
}

impl<T> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.handle
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled handle taken before drop"))
    }
}

impl<T> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.handle
            .as_mut()
            .unwrap_or_else(|| unreachable!("pooled handle taken before drop"))
    }
}

impl<T> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}
