//! Scoped repository access for one update.
//!
//! A [`RepoView`] bundles everything one update may do to a project's
//! repository: a lazily opened handle, one object inserter, one object
//! walker, and the staged ref commands. Operations only ever see the view
//! (or a read-only wrapper of it), never the raw store, so an update cannot
//! escape its project or commit refs outside its batch.

use std::sync::Arc;

use async_trait::async_trait;
use revtx_core::error::{Error as CoreError, Result as CoreResult};
use revtx_core::refs::{CommandResult, ObjectId, PendingRefUpdates, RefCommand, RefName};
use revtx_core::repo::{ObjectInserter, RepoStore, Repository, RevWalk};
use revtx_core::ProjectName;

use crate::error::Result;

/// One update's scoped access to a project repository.
pub struct RepoView {
    store: Option<Arc<dyn RepoStore>>,
    project: ProjectName,
    repo: Option<Arc<dyn Repository>>,
    inserter: Option<Box<dyn ObjectInserter>>,
    walker: Option<Box<dyn RevWalk>>,
    commands: PendingRefUpdates,
}

impl RepoView {
    /// Creates a view that opens the repository on first use.
    #[must_use]
    pub fn new(store: Arc<dyn RepoStore>, project: ProjectName) -> Self {
        Self {
            store: Some(store),
            project,
            repo: None,
            inserter: None,
            walker: None,
            commands: PendingRefUpdates::new(),
        }
    }

    /// Creates a view over an already open repository.
    #[must_use]
    pub fn with_repository(repo: Arc<dyn Repository>) -> Self {
        let project = repo.project().clone();
        Self {
            store: None,
            project,
            repo: Some(repo),
            inserter: None,
            walker: None,
            commands: PendingRefUpdates::new(),
        }
    }

    /// Returns the project this view is scoped to.
    #[must_use]
    pub fn project(&self) -> &ProjectName {
        &self.project
    }

    /// Returns the repository, opening it on first call.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository cannot be opened.
    pub async fn repository(&mut self) -> Result<Arc<dyn Repository>> {
        if let Some(repo) = &self.repo {
            return Ok(Arc::clone(repo));
        }
        let store = self.store.as_ref().ok_or_else(|| {
            CoreError::storage("repository view has neither a store nor an open repository")
        })?;
        let repo = store.open(&self.project).await?;
        self.repo = Some(Arc::clone(&repo));
        Ok(repo)
    }

    /// Returns the view's object inserter, creating it on first call.
    ///
    /// All objects an update writes go through this single inserter so
    /// they can be flushed together before the ref batch executes.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository or inserter cannot be opened.
    pub async fn inserter(&mut self) -> Result<&mut dyn ObjectInserter> {
        if self.inserter.is_none() {
            let repo = self.repository().await?;
            self.inserter = Some(repo.new_inserter()?);
        }
        // The Option is populated just above.
        match self.inserter.as_deref_mut() {
            Some(inserter) => Ok(inserter),
            None => Err(CoreError::storage("object inserter unavailable").into()),
        }
    }

    /// Returns the view's object walker, creating it on first call.
    ///
    /// The walker sees objects staged through this view's inserter even
    /// before they are flushed.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository or walker cannot be opened.
    pub async fn walker(&mut self) -> Result<&dyn RevWalk> {
        if self.walker.is_none() {
            let repo = self.repository().await?;
            self.walker = Some(repo.new_rev_walk()?);
        }
        match self.walker.as_deref() {
            Some(walker) => Ok(walker),
            None => Err(CoreError::storage("object walker unavailable").into()),
        }
    }

    /// Resolves a ref's current value in the underlying repository.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository cannot be read.
    pub async fn get_ref(&mut self, name: &RefName) -> Result<Option<ObjectId>> {
        let repo = self.repository().await?;
        Ok(repo.get_ref(name).await?)
    }

    /// Stages a ref command for the update's batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the command conflicts with an already staged
    /// command for the same ref.
    pub fn add_ref_update(&mut self, cmd: RefCommand) -> Result<()> {
        self.commands.add(cmd)?;
        Ok(())
    }

    /// Returns the staged ref commands.
    #[must_use]
    pub fn commands(&self) -> &PendingRefUpdates {
        &self.commands
    }

    /// Flushes staged objects so the ref batch can reference them.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(inserter) = &mut self.inserter {
            inserter.flush()?;
        }
        Ok(())
    }

    /// Releases the inserter and walker. Staged commands survive so the
    /// batch summary can still be built.
    pub fn close(&mut self) {
        self.inserter = None;
        self.walker = None;
    }

    /// Returns a read-only handle to the repository for change callbacks.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository cannot be opened.
    pub async fn read_only(&mut self) -> Result<ReadOnlyRepository> {
        let repo = self.repository().await?;
        Ok(ReadOnlyRepository { inner: repo })
    }
}

/// A repository handle whose write entry points are disabled.
///
/// Handed to change callbacks, which may read refs and objects but must
/// stage all writes through their context.
#[derive(Clone)]
pub struct ReadOnlyRepository {
    inner: Arc<dyn Repository>,
}

#[async_trait]
impl Repository for ReadOnlyRepository {
    fn project(&self) -> &ProjectName {
        self.inner.project()
    }

    async fn get_ref(&self, name: &RefName) -> CoreResult<Option<ObjectId>> {
        self.inner.get_ref(name).await
    }

    async fn list_refs(&self, prefix: &str) -> CoreResult<Vec<(RefName, ObjectId)>> {
        self.inner.list_refs(prefix).await
    }

    fn new_inserter(&self) -> CoreResult<Box<dyn ObjectInserter>> {
        Err(CoreError::read_only(
            "object insertion is not allowed through a read-only repository",
        ))
    }

    fn new_rev_walk(&self) -> CoreResult<Box<dyn RevWalk>> {
        self.inner.new_rev_walk()
    }

    fn supports_atomic_batch(&self) -> bool {
        self.inner.supports_atomic_batch()
    }

    async fn execute_batch(&self, _commands: &[RefCommand]) -> CoreResult<Vec<CommandResult>> {
        Err(CoreError::read_only(
            "ref updates are not allowed through a read-only repository",
        ))
    }
}
