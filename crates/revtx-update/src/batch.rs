//! The batch update orchestrator.
//!
//! A [`BatchUpdate`] collects operations against one project and executes
//! them as a single transaction: operations stage repository objects and
//! ref commands, the staged refs commit atomically, and change records are
//! rewritten to match. Several updates for different projects can be
//! executed together; each phase runs across every update before the next
//! phase starts, so no caller observes a half-applied batch.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use revtx_core::change::Change;
use revtx_core::index::ChangeIndexer;
use revtx_core::meta::MetaStore;
use revtx_core::notify::{NoopListener, RefBatchSummary, RefUpdateListener};
use revtx_core::observability::update_span;
use revtx_core::refs::{PendingRefUpdates, RefName};
use revtx_core::repo::{RepoStore, Repository};
use revtx_core::{ChangeId, Principal, ProjectName};
use tracing::{debug, warn, Instrument};

use crate::context::{ChangeContext, ChangeOutcome, Context, RepoContext};
use crate::error::{Error, Result};
use crate::op::{BatchUpdateOp, InsertChangeOp, RepoOnlyOp};
use crate::ref_update::RefUpdateValidator;
use crate::repo_view::{ReadOnlyRepository, RepoView};

/// Relative ordering of the ref commit and the change-record rewrite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Order {
    /// Refs commit before change records are rewritten. A crash between
    /// the two leaves committed refs whose records lag behind; the record
    /// rewrite is replayable.
    #[default]
    RepoBeforeDb,
    /// Change records are rewritten before repository work runs. Used by
    /// flows whose repository phase must observe the rewritten records.
    DbBeforeRepo,
}

/// What the engine did to one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeResult {
    /// No operation dirtied the change; nothing was written.
    Skipped,
    /// The change record was created or rewritten.
    Upserted,
    /// The change record was deleted.
    Deleted,
}

/// Observes phase boundaries across a co-executed group of updates.
///
/// Each callback fires exactly once per group, after that phase has run
/// for every update in it.
pub trait BatchUpdateListener: Send + Sync {
    /// All repository-update callbacks have run.
    fn after_update_repos(&self) {}
    /// All staged ref batches have committed.
    fn after_update_refs(&self) {}
    /// All change records have been rewritten.
    fn after_update_changes(&self) {}
}

/// Validates an update's staged state just before its refs commit.
#[async_trait]
pub trait OnCommitValidator: Send + Sync {
    /// Inspects the staged commands against the repository. Returning an
    /// error aborts the batch before anything commits.
    ///
    /// # Errors
    ///
    /// Any error aborts the batch.
    async fn validate(
        &self,
        repo: &ReadOnlyRepository,
        commands: &PendingRefUpdates,
    ) -> Result<()>;
}

/// Shared services from which batch updates are created.
pub struct UpdateEngine {
    repo_store: Arc<dyn RepoStore>,
    meta: Arc<dyn MetaStore>,
    indexer: Arc<dyn ChangeIndexer>,
    ref_listener: Arc<dyn RefUpdateListener>,
    tz: FixedOffset,
}

impl UpdateEngine {
    /// Creates an engine over the given stores, with no ref listener and
    /// UTC timestamps.
    #[must_use]
    pub fn new(
        repo_store: Arc<dyn RepoStore>,
        meta: Arc<dyn MetaStore>,
        indexer: Arc<dyn ChangeIndexer>,
    ) -> Self {
        Self {
            repo_store,
            meta,
            indexer,
            ref_listener: Arc::new(NoopListener),
            tz: Utc.fix(),
        }
    }

    /// Sets the listener fired for every committed ref batch.
    #[must_use]
    pub fn with_ref_listener(mut self, listener: Arc<dyn RefUpdateListener>) -> Self {
        self.ref_listener = listener;
        self
    }

    /// Sets the timezone used to render user-visible timestamps.
    #[must_use]
    pub fn with_timezone(mut self, tz: FixedOffset) -> Self {
        self.tz = tz;
        self
    }

    /// Creates a new empty update against one project.
    ///
    /// `when` stamps every write the update makes; co-executed updates may
    /// carry different timestamps.
    #[must_use]
    pub fn new_update(
        &self,
        project: ProjectName,
        principal: Principal,
        when: DateTime<Utc>,
    ) -> BatchUpdate {
        BatchUpdate {
            project: project.clone(),
            principal,
            when,
            tz: self.tz,
            order: Order::default(),
            parallel: false,
            ref_log_message: None,
            view: RepoView::new(Arc::clone(&self.repo_store), project),
            ops: BTreeMap::new(),
            repo_only_ops: Vec::new(),
            new_changes: HashMap::new(),
            on_commit_validator: None,
            meta: Arc::clone(&self.meta),
            indexer: Arc::clone(&self.indexer),
            ref_listener: Arc::clone(&self.ref_listener),
            executed: false,
            summary: None,
            change_results: BTreeMap::new(),
        }
    }
}

/// One transactional update against one project.
pub struct BatchUpdate {
    project: ProjectName,
    principal: Principal,
    when: DateTime<Utc>,
    tz: FixedOffset,
    order: Order,
    parallel: bool,
    ref_log_message: Option<String>,
    view: RepoView,
    ops: BTreeMap<ChangeId, Vec<Arc<dyn BatchUpdateOp>>>,
    repo_only_ops: Vec<Arc<dyn RepoOnlyOp>>,
    new_changes: HashMap<ChangeId, Change>,
    on_commit_validator: Option<Arc<dyn OnCommitValidator>>,
    meta: Arc<dyn MetaStore>,
    indexer: Arc<dyn ChangeIndexer>,
    ref_listener: Arc<dyn RefUpdateListener>,
    executed: bool,
    summary: Option<RefBatchSummary>,
    change_results: BTreeMap<ChangeId, ChangeResult>,
}

impl BatchUpdate {
    /// Returns the project this update targets.
    #[must_use]
    pub fn project(&self) -> &ProjectName {
        &self.project
    }

    /// Sets the phase ordering. Co-executed updates must agree on it.
    pub fn set_order(&mut self, order: Order) -> &mut Self {
        self.order = order;
        self
    }

    /// Sets the message recorded in the ref log for every applied command.
    pub fn set_ref_log_message(&mut self, message: impl Into<String>) -> &mut Self {
        self.ref_log_message = Some(message.into());
        self
    }

    /// Sets a validator invoked just before the staged refs commit.
    pub fn set_on_commit_validator(&mut self, validator: Arc<dyn OnCommitValidator>) -> &mut Self {
        self.on_commit_validator = Some(validator);
        self
    }

    /// Runs the change-update phase on one task per change. Only valid
    /// when this update executes alone.
    pub fn update_changes_in_parallel(&mut self) -> &mut Self {
        self.parallel = true;
        self
    }

    /// Supplies an already open repository instead of opening one from
    /// the store.
    ///
    /// # Errors
    ///
    /// Returns a caller error if the repository belongs to another project.
    pub fn set_repository(&mut self, repo: Arc<dyn Repository>) -> Result<&mut Self> {
        if repo.project() != &self.project {
            return Err(Error::caller(format!(
                "repository for {} supplied to update of {}",
                repo.project(),
                self.project
            )));
        }
        self.view = RepoView::with_repository(repo);
        Ok(self)
    }

    /// Adds an operation against one change. Operations on the same
    /// change run in registration order.
    pub fn add_op<O: BatchUpdateOp + 'static>(&mut self, id: ChangeId, op: Arc<O>) -> &mut Self {
        self.ops.entry(id).or_default().push(op);
        self
    }

    /// Adds an operation that touches only the repository.
    pub fn add_repo_only_op<O: RepoOnlyOp + 'static>(&mut self, op: Arc<O>) -> &mut Self {
        self.repo_only_ops.push(op);
        self
    }

    /// Registers an operation that creates a new change.
    ///
    /// The change record is built eagerly so registration errors surface
    /// here, not at execution. The insert operation runs before any other
    /// operation on its change.
    ///
    /// # Errors
    ///
    /// Returns a caller error if a change with this ID was already
    /// inserted into this update, or if the operation builds a record
    /// with a different ID.
    pub async fn insert_change<O: InsertChangeOp + 'static>(
        &mut self,
        id: ChangeId,
        op: Arc<O>,
    ) -> Result<&mut Self> {
        if self.new_changes.contains_key(&id) {
            return Err(Error::caller(format!(
                "change {id} inserted twice into one update"
            )));
        }
        let ctx = self.context();
        let change = op.create_change(&ctx).await?;
        if change.id != id {
            return Err(Error::caller(format!(
                "insert operation for change {id} built a record for change {}",
                change.id
            )));
        }
        self.new_changes.insert(id, change);
        self.ops.entry(id).or_default().insert(0, op);
        Ok(self)
    }

    /// Returns what the executed ref batch did, if this update has run.
    #[must_use]
    pub fn ref_update_summary(&self) -> Option<&RefBatchSummary> {
        self.summary.as_ref()
    }

    /// Returns the refs whose commands were applied.
    #[must_use]
    pub fn successfully_updated_refs(&self) -> Vec<RefName> {
        self.summary
            .as_ref()
            .map(|s| s.succeeded().into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns what the engine did to each change.
    #[must_use]
    pub fn change_results(&self) -> &BTreeMap<ChangeId, ChangeResult> {
        &self.change_results
    }

    /// Executes this update alone.
    ///
    /// # Errors
    ///
    /// See [`execute_all`](BatchUpdate::execute_all).
    pub async fn execute(&mut self, dry_run: bool) -> Result<()> {
        Self::execute_all(std::slice::from_mut(self), &[], dry_run).await
    }

    /// Executes a group of updates as one logical transaction.
    ///
    /// Phase N runs across every update before phase N+1 starts anywhere.
    /// With [`Order::RepoBeforeDb`] the phases are repository updates, ref
    /// commits, then change-record rewrites; [`Order::DbBeforeRepo`]
    /// rewrites records first.
    ///
    /// In dry-run mode every phase runs but nothing commits and no
    /// post-commit effect fires.
    ///
    /// After all updates commit: spawned index writes are awaited, ref
    /// listeners fire, and post-update hooks run. Failures in those steps
    /// are logged, never propagated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Caller`] for misuse (a reused update, mixed
    /// orderings, parallel change updates in a group),
    /// [`Error::LockFailure`] when the whole group can be retried from
    /// scratch, and [`Error::RefUpdateFailed`] or [`Error::UpdateFailed`]
    /// for fatal failures.
    pub async fn execute_all(
        updates: &mut [BatchUpdate],
        listeners: &[Arc<dyn BatchUpdateListener>],
        dry_run: bool,
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        for update in updates.iter() {
            if update.executed {
                return Err(Error::caller("batch update executed twice"));
            }
        }
        let order = updates[0].order;
        if updates.iter().any(|u| u.order != order) {
            return Err(Error::caller(
                "co-executed updates must agree on phase ordering",
            ));
        }
        if updates.len() > 1 && updates.iter().any(|u| u.parallel) {
            return Err(Error::caller(
                "parallel change updates are only supported for a single update",
            ));
        }

        let result = Self::run_phases(updates, listeners, order, dry_run).await;
        for update in updates.iter_mut() {
            update.view.close();
            update.executed = true;
        }
        result?;

        if !dry_run {
            Self::post_commit(updates).await;
        }
        Ok(())
    }

    async fn run_phases(
        updates: &mut [BatchUpdate],
        listeners: &[Arc<dyn BatchUpdateListener>],
        order: Order,
        dry_run: bool,
    ) -> Result<()> {
        match order {
            Order::RepoBeforeDb => {
                for update in updates.iter_mut() {
                    update.update_repo_phase().await?;
                }
                for listener in listeners {
                    listener.after_update_repos();
                }
                for update in updates.iter_mut() {
                    update.commit_refs_phase(dry_run).await?;
                }
                for listener in listeners {
                    listener.after_update_refs();
                }
                for update in updates.iter_mut() {
                    update.update_changes_phase(dry_run).await?;
                }
                for listener in listeners {
                    listener.after_update_changes();
                }
            }
            Order::DbBeforeRepo => {
                for update in updates.iter_mut() {
                    update.update_changes_phase(dry_run).await?;
                }
                for listener in listeners {
                    listener.after_update_changes();
                }
                for update in updates.iter_mut() {
                    update.update_repo_phase().await?;
                }
                for listener in listeners {
                    listener.after_update_repos();
                }
                for update in updates.iter_mut() {
                    update.commit_refs_phase(dry_run).await?;
                }
                for listener in listeners {
                    listener.after_update_refs();
                }
            }
        }
        Ok(())
    }

    fn context(&self) -> Context {
        Context::new(
            self.project.clone(),
            self.principal,
            self.when,
            self.tz,
            self.order,
        )
    }

    fn ref_log_message(&self) -> &str {
        self.ref_log_message.as_deref().unwrap_or("batch update")
    }

    async fn update_repo_phase(&mut self) -> Result<()> {
        let span = update_span("update_repo", self.project.as_str());
        async {
            let ctx = self.context();
            for ops in self.ops.values() {
                for op in ops {
                    let mut repo_ctx = RepoContext::new(&ctx, &mut self.view);
                    op.update_repo(&mut repo_ctx).await?;
                }
            }
            for op in &self.repo_only_ops {
                let mut repo_ctx = RepoContext::new(&ctx, &mut self.view);
                op.update_repo(&mut repo_ctx).await?;
            }

            // Validators see the staged commands and the pending object
            // set before anything is flushed or committed.
            if !self.view.commands().is_empty() {
                if let Some(validator) = self.on_commit_validator.clone() {
                    let repo = self.view.read_only().await?;
                    validator.validate(&repo, self.view.commands()).await?;
                }
                self.view.flush()?;
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn commit_refs_phase(&mut self, dry_run: bool) -> Result<()> {
        let span = update_span("commit_refs", self.project.as_str());
        async {
            if self.view.commands().is_empty() {
                self.summary = Some(RefBatchSummary::empty(
                    self.project.clone(),
                    self.ref_log_message().to_string(),
                ));
                return Ok(());
            }

            let repo = self.view.repository().await?;
            let message = self.ref_log_message().to_string();
            let summary =
                RefUpdateValidator::execute(repo.as_ref(), &message, self.view.commands(), dry_run)
                    .await?;
            self.summary = Some(summary);
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn update_changes_phase(&mut self, dry_run: bool) -> Result<()> {
        let span = update_span("update_changes", self.project.as_str());
        async {
            if self.ops.is_empty() {
                return Ok(());
            }
            let ctx = self.context();
            let repo = self.view.read_only().await?;

            let outcomes = if self.parallel {
                self.run_change_ops_parallel(&ctx, &repo).await?
            } else {
                self.run_change_ops_sequential(&ctx, &repo).await?
            };

            let mut manager = self.meta.update_manager(&self.project);
            let mut any_write = false;
            for (id, outcome) in outcomes {
                let result = match outcome {
                    ChangeOutcome::Skipped => ChangeResult::Skipped,
                    ChangeOutcome::Upserted(change, updates) => {
                        if !dry_run {
                            manager.stage_upsert(change, updates);
                        }
                        any_write = true;
                        ChangeResult::Upserted
                    }
                    ChangeOutcome::Deleted => {
                        if !dry_run {
                            manager.stage_delete(id);
                        }
                        any_write = true;
                        ChangeResult::Deleted
                    }
                };
                self.change_results.insert(id, result);
            }

            if !dry_run && any_write {
                manager
                    .execute()
                    .await
                    .map_err(|e| Error::update_failed("committing change records", e))?;
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn run_change_ops_sequential(
        &self,
        ctx: &Context,
        repo: &ReadOnlyRepository,
    ) -> Result<Vec<(ChangeId, ChangeOutcome)>> {
        let mut outcomes = Vec::with_capacity(self.ops.len());
        for (&id, ops) in &self.ops {
            let (change, is_new) = self.load_change(id).await?;
            let mut change_ctx = ChangeContext::new(ctx.clone(), change, is_new, repo.clone());
            let mut dirty = false;
            for op in ops {
                dirty |= op.update_change(&mut change_ctx).await?;
            }
            outcomes.push((id, change_ctx.finish(dirty)));
        }
        Ok(outcomes)
    }

    async fn run_change_ops_parallel(
        &self,
        ctx: &Context,
        repo: &ReadOnlyRepository,
    ) -> Result<Vec<(ChangeId, ChangeOutcome)>> {
        let mut handles = Vec::with_capacity(self.ops.len());
        for (&id, ops) in &self.ops {
            let (change, is_new) = self.load_change(id).await?;
            let ops = ops.clone();
            let ctx = ctx.clone();
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                let mut change_ctx = ChangeContext::new(ctx, change, is_new, repo);
                let mut dirty = false;
                for op in &ops {
                    dirty |= op.update_change(&mut change_ctx).await?;
                }
                Ok::<_, Error>((id, change_ctx.finish(dirty)))
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            let outcome = handle
                .await
                .map_err(|e| Error::update_failed("change update task failed", e))??;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn load_change(&self, id: ChangeId) -> Result<(Change, bool)> {
        if let Some(change) = self.new_changes.get(&id) {
            return Ok((change.clone(), true));
        }
        match self.meta.load(&self.project, id).await? {
            Some(change) => Ok((change, false)),
            None => Err(Error::caller(format!(
                "change {id} does not exist in project {}",
                self.project
            ))),
        }
    }

    /// Returns whether committed results of this update should be
    /// reindexed. A batch whose ref commands touch only the
    /// draft-comments namespace carries no indexed fields.
    fn requires_reindex(&self) -> bool {
        match &self.summary {
            Some(summary) if !summary.is_empty() => !summary
                .commands
                .iter()
                .all(|(cmd, _)| cmd.name.is_draft_comments()),
            _ => true,
        }
    }

    async fn post_commit(updates: &[BatchUpdate]) {
        // Index writes first, concurrently across changes.
        let mut handles = Vec::new();
        for update in updates.iter().filter(|u| u.requires_reindex()) {
            for (&id, result) in &update.change_results {
                let indexer = Arc::clone(&update.indexer);
                let project = update.project.clone();
                match result {
                    ChangeResult::Upserted => {
                        handles.push(tokio::spawn(async move {
                            indexer.index(&project, id).await
                        }));
                    }
                    ChangeResult::Deleted => {
                        handles.push(tokio::spawn(async move { indexer.delete(id).await }));
                    }
                    ChangeResult::Skipped => {}
                }
            }
        }
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "index write failed after commit"),
                Err(e) => warn!(error = %e, "index task failed after commit"),
            }
        }

        for update in updates.iter() {
            if let Some(summary) = &update.summary {
                if !summary.is_empty() {
                    update.ref_listener.fire(summary, update.principal.account());
                }
            }
        }

        for update in updates.iter() {
            let ctx = update.context();
            for ops in update.ops.values() {
                for op in ops {
                    if let Err(e) = op.post_update(&ctx).await {
                        warn!(
                            project = %update.project,
                            error = %e,
                            "post-update hook failed"
                        );
                    }
                }
            }
            for op in &update.repo_only_ops {
                if let Err(e) = op.post_update(&ctx).await {
                    warn!(
                        project = %update.project,
                        error = %e,
                        "post-update hook failed"
                    );
                }
            }
        }
        debug!(updates = updates.len(), "post-commit effects fired");
    }
}
