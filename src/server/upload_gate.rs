//! Upload concurrency gate
//!
//! A counting semaphore around the whole ingestion run. Acquisition never
//! waits: a full gate rejects immediately.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Default number of simultaneous ingestions
pub const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("too many concurrent uploads (limit {limit})")]
    TooManyUploads { limit: usize },

    #[error("upload gate closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct UploadGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Held for the duration of one ingestion.
#[derive(Debug)]
pub struct UploadPermit {
    _permit: OwnedSemaphorePermit,
}

impl Default for UploadGate {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_UPLOADS)
    }
}

impl UploadGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn try_acquire(&self) -> Result<UploadPermit, GateError> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(UploadPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) => Err(GateError::TooManyUploads {
                limit: self.capacity,
            }),
            Err(TryAcquireError::Closed) => Err(GateError::Closed),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
