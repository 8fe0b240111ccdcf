//! The secondary change index.
//!
//! Indexing runs after the storage transaction commits and is best-effort:
//! a failed index write is logged and repaired by background reconciliation,
//! never propagated to the caller.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::id::{ChangeId, ProjectName};

/// Writes change records into the secondary index.
#[async_trait]
pub trait ChangeIndexer: Send + Sync {
    /// Reindexes a change from its authoritative record.
    ///
    /// # Errors
    ///
    /// Returns an error if the index write fails.
    async fn index(&self, project: &ProjectName, id: ChangeId) -> Result<()>;

    /// Removes a change from the index.
    ///
    /// # Errors
    ///
    /// Returns an error if the index write fails.
    async fn delete(&self, id: ChangeId) -> Result<()>;
}

/// Test indexer that records every call and can be made to fail.
#[derive(Default)]
pub struct RecordingIndexer {
    indexed: Mutex<Vec<(ProjectName, ChangeId)>>,
    deleted: Mutex<Vec<ChangeId>>,
    fail: AtomicBool,
}

impl RecordingIndexer {
    /// Creates an indexer that records calls and succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail.
    pub fn fail_all(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Returns the recorded index calls.
    #[must_use]
    pub fn indexed(&self) -> Vec<(ProjectName, ChangeId)> {
        match self.indexed.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Returns the recorded delete calls.
    #[must_use]
    pub fn deleted(&self) -> Vec<ChangeId> {
        match self.deleted.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl ChangeIndexer for RecordingIndexer {
    async fn index(&self, project: &ProjectName, id: ChangeId) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::storage("injected index failure"));
        }
        let mut indexed = match self.indexed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        indexed.push((project.clone(), id));
        Ok(())
    }

    async fn delete(&self, id: ChangeId) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::storage("injected index failure"));
        }
        let mut deleted = match self.deleted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        deleted.push(id);
        Ok(())
    }
}
