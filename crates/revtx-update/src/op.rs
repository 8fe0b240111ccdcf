//! Operation traits implemented by callers of the update engine.
//!
//! An operation describes one logical mutation. The engine drives its
//! callbacks through the phases of a batch: repository updates first or
//! last depending on the batch's ordering, change updates against loaded
//! records, and post-commit hooks after everything is durable.

use async_trait::async_trait;

use revtx_core::change::Change;

use crate::context::{ChangeContext, Context, RepoContext};
use crate::error::Result;

/// An operation that touches only the repository, not change records.
///
/// Both callbacks have no-op defaults so implementors override only what
/// they need.
#[async_trait]
pub trait RepoOnlyOp: Send + Sync {
    /// Stages repository changes: inserts objects and stages ref commands
    /// through the context.
    ///
    /// # Errors
    ///
    /// Returning an error aborts the whole batch before anything commits.
    async fn update_repo(&self, ctx: &mut RepoContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Runs after the batch has fully committed, for side effects such as
    /// sending email. Failures are logged, never propagated.
    ///
    /// # Errors
    ///
    /// Returning an error only produces a log entry.
    async fn post_update(&self, ctx: &Context) -> Result<()> {
        let _ = ctx;
        Ok(())
    }
}

/// An operation against one change.
///
/// Added to a batch under a change ID; the engine loads that change and
/// invokes [`update_change`](BatchUpdateOp::update_change) with a context
/// scoped to it.
#[async_trait]
pub trait BatchUpdateOp: RepoOnlyOp {
    /// Stages mutations against the loaded change.
    ///
    /// Returns whether this operation dirtied the change. A change left
    /// clean by every operation is skipped: no metadata write and no
    /// reindex.
    ///
    /// # Errors
    ///
    /// Returning an error aborts the whole batch before anything commits.
    async fn update_change(&self, ctx: &mut ChangeContext) -> Result<bool> {
        let _ = ctx;
        Ok(false)
    }
}

/// An operation that brings a new change into existence.
///
/// The engine calls [`create_change`](InsertChangeOp::create_change) once,
/// eagerly at registration, then treats the operation as a regular
/// [`BatchUpdateOp`] against the freshly created record. Within its change
/// the insert operation always runs before any other operation.
#[async_trait]
pub trait InsertChangeOp: BatchUpdateOp {
    /// Builds the new change record.
    ///
    /// # Errors
    ///
    /// Returning an error fails registration; nothing is staged.
    async fn create_change(&self, ctx: &Context) -> Result<Change>;
}
