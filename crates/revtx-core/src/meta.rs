//! Change metadata storage: loading change records and staging deltas.
//!
//! A [`MetaUpdate`] is a delta against one change, scoped to a patch set.
//! Deltas are staged through a per-project [`MetaUpdateManager`] and applied
//! all-or-nothing by [`MetaUpdateManager::execute`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::change::{Change, ChangeStatus};
use crate::error::{Error, Result};
use crate::id::{ChangeId, PatchSetId, Principal, ProjectName};

/// A staged delta against one change's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaUpdate {
    /// The patch set this delta is scoped to.
    pub patch_set: PatchSetId,
    /// When the delta was made.
    pub when: DateTime<Utc>,
    /// Who made the delta.
    pub author: Principal,
    /// Human-readable message recorded in the change's log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// New lifecycle state, if changing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_status: Option<ChangeStatus>,
    /// New subject line, if changing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_subject: Option<String>,
    /// Marks the delta's patch set as the current one.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub set_current_patch_set: bool,
}

impl MetaUpdate {
    /// Creates an empty delta for a patch set.
    #[must_use]
    pub fn new(patch_set: PatchSetId, when: DateTime<Utc>, author: Principal) -> Self {
        Self {
            patch_set,
            when,
            author,
            message: None,
            new_status: None,
            new_subject: None,
            set_current_patch_set: false,
        }
    }

    /// Sets the log message.
    pub fn set_message(&mut self, message: impl Into<String>) -> &mut Self {
        self.message = Some(message.into());
        self
    }

    /// Sets a new lifecycle state.
    pub fn set_status(&mut self, status: ChangeStatus) -> &mut Self {
        self.new_status = Some(status);
        self
    }

    /// Sets a new subject line.
    pub fn set_subject(&mut self, subject: impl Into<String>) -> &mut Self {
        self.new_subject = Some(subject.into());
        self
    }

    /// Marks this delta's patch set as current.
    pub fn set_current_patch_set(&mut self) -> &mut Self {
        self.set_current_patch_set = true;
        self
    }

    /// Returns whether the delta carries no modifications.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.message.is_none()
            && self.new_status.is_none()
            && self.new_subject.is_none()
            && !self.set_current_patch_set
    }

    /// Applies this delta to a change record.
    pub fn apply_to(&self, change: &mut Change) {
        if let Some(status) = self.new_status {
            change.status = status;
        }
        if let Some(subject) = &self.new_subject {
            change.subject = subject.clone();
        }
        if self.set_current_patch_set {
            change.current_patch_set = Some(self.patch_set);
        }
        change.last_updated_on = self.when;
    }
}

/// Stages metadata writes for one project and applies them together.
///
/// Staged writes are invisible until [`execute`](MetaUpdateManager::execute),
/// which applies everything or nothing.
#[async_trait]
pub trait MetaUpdateManager: Send {
    /// Stages an upserted change record and the deltas that produced it.
    fn stage_upsert(&mut self, change: Change, updates: Vec<MetaUpdate>);

    /// Stages deletion of a change record.
    fn stage_delete(&mut self, id: ChangeId);

    /// Applies all staged writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the writes cannot be applied; in that case no
    /// staged write is visible.
    async fn execute(self: Box<Self>) -> Result<()>;
}

/// Loads change records and creates per-project update managers.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Loads a change record, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be read.
    async fn load(&self, project: &ProjectName, id: ChangeId) -> Result<Option<Change>>;

    /// Creates an update manager scoped to one project.
    fn update_manager(&self, project: &ProjectName) -> Box<dyn MetaUpdateManager>;
}

#[derive(Debug, Default)]
struct MetaState {
    changes: HashMap<ChangeId, Change>,
    log: Vec<String>,
}

/// In-memory [`MetaStore`] used by tests and single-process deployments.
#[derive(Default)]
pub struct MemoryMetaStore {
    projects: RwLock<HashMap<ProjectName, std::sync::Arc<RwLock<MetaState>>>>,
    fail_next_execute: AtomicBool,
}

impl MemoryMetaStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next manager execution fail, leaving nothing applied.
    pub fn fail_next_execute(&self) {
        self.fail_next_execute.store(true, Ordering::SeqCst);
    }

    fn project_state(&self, project: &ProjectName) -> std::sync::Arc<RwLock<MetaState>> {
        let mut projects = match self.projects.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::sync::Arc::clone(
            projects
                .entry(project.clone())
                .or_insert_with(std::sync::Arc::default),
        )
    }

    /// Returns a change record directly. Test helper.
    #[must_use]
    pub fn change(&self, project: &ProjectName, id: ChangeId) -> Option<Change> {
        let state = self.project_state(project);
        let guard = match state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.changes.get(&id).cloned()
    }

    /// Returns the number of recorded delta log lines for a project.
    /// Test helper.
    #[must_use]
    pub fn log_len(&self, project: &ProjectName) -> usize {
        let state = self.project_state(project);
        let guard = match state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.log.len()
    }

    /// Seeds a change record directly. Test setup only.
    pub fn put_change(&self, change: Change) {
        let state = self.project_state(&change.project);
        let mut guard = match state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.changes.insert(change.id, change);
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn load(&self, project: &ProjectName, id: ChangeId) -> Result<Option<Change>> {
        Ok(self.change(project, id))
    }

    fn update_manager(&self, project: &ProjectName) -> Box<dyn MetaUpdateManager> {
        Box::new(MemoryMetaUpdateManager {
            state: self.project_state(project),
            fail: self.fail_next_execute.swap(false, Ordering::SeqCst),
            upserts: Vec::new(),
            deletes: Vec::new(),
        })
    }
}

enum StagedWrite {
    Upsert(Change),
    Delete(ChangeId),
}

struct MemoryMetaUpdateManager {
    state: std::sync::Arc<RwLock<MetaState>>,
    fail: bool,
    upserts: Vec<(Change, Vec<MetaUpdate>)>,
    deletes: Vec<ChangeId>,
}

#[async_trait]
impl MetaUpdateManager for MemoryMetaUpdateManager {
    fn stage_upsert(&mut self, change: Change, updates: Vec<MetaUpdate>) {
        self.upserts.push((change, updates));
    }

    fn stage_delete(&mut self, id: ChangeId) {
        self.deletes.push(id);
    }

    async fn execute(self: Box<Self>) -> Result<()> {
        if self.fail {
            return Err(Error::storage("injected metadata write failure"));
        }
        // Serialize deltas up front so an encoding failure leaves state
        // untouched.
        let mut writes = Vec::new();
        for (change, updates) in self.upserts {
            let mut lines = Vec::with_capacity(updates.len());
            for update in &updates {
                let line = serde_json::to_string(update).map_err(|e| Error::Serialization {
                    message: format!("encoding metadata delta for change {}: {e}", change.id),
                })?;
                lines.push(line);
            }
            writes.push((StagedWrite::Upsert(change), lines));
        }
        for id in self.deletes {
            writes.push((StagedWrite::Delete(id), Vec::new()));
        }

        let mut state = self.state.write().map_err(|e| Error::Storage {
            message: format!("metadata lock poisoned: {e}"),
            source: None,
        })?;
        for (write, lines) in writes {
            match write {
                StagedWrite::Upsert(change) => {
                    state.changes.insert(change.id, change);
                }
                StagedWrite::Delete(id) => {
                    state.changes.remove(&id);
                }
            }
            state.log.extend(lines);
        }
        Ok(())
    }
}
