//! Capability contexts handed to operation callbacks.
//!
//! Each phase of an update sees exactly the capabilities it is allowed to
//! use: [`Context`] is read-only metadata about the update, [`RepoContext`]
//! adds staged repository access, and [`ChangeContext`] adds mutation
//! handles for one change. An operation cannot reach outside its context.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use revtx_core::change::Change;
use revtx_core::meta::MetaUpdate;
use revtx_core::refs::{ObjectId, RefCommand, RefName};
use revtx_core::repo::{ObjectInserter, Repository, RevWalk};
use revtx_core::{AccountId, ChangeId, PatchSetId, Principal, ProjectName};

use crate::batch::Order;
use crate::error::{Error, Result};
use crate::repo_view::{ReadOnlyRepository, RepoView};

/// Read-only metadata shared by every phase of one update.
#[derive(Debug, Clone)]
pub struct Context {
    project: ProjectName,
    principal: Principal,
    when: DateTime<Utc>,
    tz: FixedOffset,
    order: Order,
}

impl Context {
    pub(crate) fn new(
        project: ProjectName,
        principal: Principal,
        when: DateTime<Utc>,
        tz: FixedOffset,
        order: Order,
    ) -> Self {
        Self {
            project,
            principal,
            when,
            tz,
            order,
        }
    }

    /// Returns the project being updated.
    #[must_use]
    pub fn project(&self) -> &ProjectName {
        &self.project
    }

    /// Returns the principal the update runs as.
    #[must_use]
    pub fn principal(&self) -> Principal {
        self.principal
    }

    /// Returns the acting account, if the update runs on behalf of a user.
    #[must_use]
    pub fn account(&self) -> Option<AccountId> {
        self.principal.account()
    }

    /// Returns the single timestamp used for every write in the update.
    #[must_use]
    pub fn when(&self) -> DateTime<Utc> {
        self.when
    }

    /// Returns the timezone in which user-visible timestamps are rendered.
    #[must_use]
    pub fn tz(&self) -> FixedOffset {
        self.tz
    }

    /// Returns the phase ordering the update executes with.
    #[must_use]
    pub fn order(&self) -> Order {
        self.order
    }
}

/// Context for the repository-update phase.
///
/// Grants staged access to the update's project repository: object
/// insertion, object walking, ref reads, and staging of ref commands.
/// Nothing is visible outside the update until its batch commits.
pub struct RepoContext<'a> {
    ctx: &'a Context,
    view: &'a mut RepoView,
}

impl<'a> RepoContext<'a> {
    pub(crate) fn new(ctx: &'a Context, view: &'a mut RepoView) -> Self {
        Self { ctx, view }
    }

    /// Returns the update's shared metadata.
    #[must_use]
    pub fn ctx(&self) -> &Context {
        self.ctx
    }

    /// Returns the repository being updated.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository cannot be opened.
    pub async fn repository(&mut self) -> Result<Arc<dyn Repository>> {
        self.view.repository().await
    }

    /// Returns the update's shared object inserter.
    ///
    /// # Errors
    ///
    /// Returns an error if the inserter cannot be opened.
    pub async fn inserter(&mut self) -> Result<&mut dyn ObjectInserter> {
        self.view.inserter().await
    }

    /// Returns the update's object walker, which sees staged objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the walker cannot be opened.
    pub async fn walker(&mut self) -> Result<&dyn RevWalk> {
        self.view.walker().await
    }

    /// Resolves a ref's currently committed value.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository cannot be read.
    pub async fn get_ref(&mut self, name: &RefName) -> Result<Option<ObjectId>> {
        self.view.get_ref(name).await
    }

    /// Stages a ref command for the update's batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the command conflicts with an already staged
    /// command for the same ref.
    pub fn add_ref_update(&mut self, cmd: RefCommand) -> Result<()> {
        self.view.add_ref_update(cmd)
    }
}

/// What one change callback did, combined with its dirty flag by the
/// engine after the callback returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChangeOutcome {
    Skipped,
    Upserted(Change, Vec<MetaUpdate>),
    Deleted,
}

/// Context for the change-update phase, scoped to one change.
///
/// Owns its state completely so change callbacks for different changes can
/// run on separate tasks.
pub struct ChangeContext {
    ctx: Context,
    change: Change,
    is_new: bool,
    deleted: bool,
    updates: BTreeMap<u32, MetaUpdate>,
    repo: ReadOnlyRepository,
}

impl ChangeContext {
    pub(crate) fn new(
        ctx: Context,
        change: Change,
        is_new: bool,
        repo: ReadOnlyRepository,
    ) -> Self {
        Self {
            ctx,
            change,
            is_new,
            deleted: false,
            updates: BTreeMap::new(),
            repo,
        }
    }

    /// Returns the update's shared metadata.
    #[must_use]
    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    /// Returns the change record as loaded (or as freshly created).
    ///
    /// Staged deltas are not yet applied to this record; they take effect
    /// when the update commits.
    #[must_use]
    pub fn change(&self) -> &Change {
        &self.change
    }

    /// Returns the change's ID.
    #[must_use]
    pub fn change_id(&self) -> ChangeId {
        self.change.id
    }

    /// Returns whether the change was created by this update.
    #[must_use]
    pub fn is_new_change(&self) -> bool {
        self.is_new
    }

    /// Returns a read-only handle to the project repository.
    #[must_use]
    pub fn repository(&self) -> &ReadOnlyRepository {
        &self.repo
    }

    /// Returns the staged delta for a patch set, creating it on first use.
    ///
    /// All callers asking for the same patch set share one delta, stamped
    /// with the update's timestamp and principal.
    ///
    /// # Errors
    ///
    /// Returns a caller error if the patch set belongs to another change.
    pub fn update(&mut self, patch_set: PatchSetId) -> Result<&mut MetaUpdate> {
        if patch_set.change != self.change.id {
            return Err(Error::caller(format!(
                "patch set {patch_set} does not belong to change {}",
                self.change.id
            )));
        }
        let when = self.ctx.when();
        let author = self.ctx.principal();
        Ok(self
            .updates
            .entry(patch_set.number)
            .or_insert_with(|| MetaUpdate::new(patch_set, when, author)))
    }

    /// Returns the acting principal's permission view on this change.
    #[must_use]
    pub fn control(&self) -> ChangeControl {
        ChangeControl {
            owner: self.change.owner,
            principal: self.ctx.principal(),
        }
    }

    /// Marks the change for deletion when the update commits.
    pub fn delete_change(&mut self) {
        self.deleted = true;
    }

    /// Returns whether the change is marked for deletion.
    #[must_use]
    pub fn deleted(&self) -> bool {
        self.deleted
    }

    /// Consumes the context into its staged outcome.
    ///
    /// `dirty` is the callback's return value. A change no operation
    /// dirtied is skipped outright, discarding staged deltas and the
    /// deletion flag; for a dirty change, deletion wins over the deltas.
    pub(crate) fn finish(self, dirty: bool) -> ChangeOutcome {
        if !dirty {
            return ChangeOutcome::Skipped;
        }
        if self.deleted {
            return ChangeOutcome::Deleted;
        }
        let mut change = self.change;
        let updates: Vec<MetaUpdate> = self
            .updates
            .into_values()
            .filter(|u| !u.is_empty())
            .collect();
        for update in &updates {
            update.apply_to(&mut change);
        }
        ChangeOutcome::Upserted(change, updates)
    }
}

/// What the acting principal may do to one change.
///
/// Enough for operations to gate their own staging decisions; full
/// rule evaluation lives outside the engine.
#[derive(Debug, Clone, Copy)]
pub struct ChangeControl {
    owner: AccountId,
    principal: Principal,
}

impl ChangeControl {
    /// Returns whether the acting principal owns the change.
    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.principal.account() == Some(self.owner)
    }

    /// Returns whether the acting principal may modify the change. The
    /// server identity may modify anything; users only their own changes.
    #[must_use]
    pub fn can_update(&self) -> bool {
        matches!(self.principal, Principal::Server) || self.is_owner()
    }
}
