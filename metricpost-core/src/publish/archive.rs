//! In-memory archive of batches that exhausted their retries
//!
//! The archive lives only as long as its publisher. Batches are kept
//! verbatim, oldest first, until they are replayed or cleared.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::events::EventBatch;

/// A batch whose delivery failed on every attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedBatch {
    /// The undelivered events, in original order
    pub batch: EventBatch,
    /// Attempts made before giving up
    pub attempts: u32,
    /// Error from the final attempt
    pub last_error: String,
    /// When the batch was archived
    pub archived_at: DateTime<Utc>,
}

/// Ordered store of [`FailedBatch`]es
#[derive(Debug, Default)]
pub struct FailedBatchArchive {
    batches: Mutex<Vec<FailedBatch>>,
}

impl FailedBatchArchive {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<FailedBatch>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a failed batch
    pub fn record(&self, failed: FailedBatch) {
        self.lock().push(failed);
    }

    /// Snapshot of all archived batches, oldest first
    pub fn list_all(&self) -> Vec<FailedBatch> {
        self.lock().clone()
    }

    /// Remove and return every archived batch, oldest first
    pub fn take_all(&self) -> Vec<FailedBatch> {
        std::mem::take(&mut *self.lock())
    }

    /// Discard every archived batch, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut batches = self.lock();
        let dropped = batches.len();
        batches.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
