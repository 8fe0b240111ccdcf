//! # revtx-update
//!
//! The transactional batch-update and retry engine for revtx.
//!
//! All mutations of review state go through a [`BatchUpdate`]: operations
//! stage repository objects and compare-and-swap ref commands, the staged
//! refs commit atomically, and change records are rewritten to match. A
//! batch that loses a compare-and-swap race leaves nothing applied and can
//! be rerun wholesale by [`RetryHelper`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chrono::Utc;
//! use revtx_core::prelude::*;
//! use revtx_core::{MemoryMetaStore, MemoryRepoStore, RecordingIndexer};
//! use revtx_update::{BatchUpdate, UpdateEngine};
//!
//! # async fn run() -> revtx_update::Result<()> {
//! let engine = UpdateEngine::new(
//!     Arc::new(MemoryRepoStore::new()),
//!     Arc::new(MemoryMetaStore::new()),
//!     Arc::new(RecordingIndexer::new()),
//! );
//! let project = ProjectName::new("acme/widgets")?;
//! let mut update = engine.new_update(project, Principal::Server, Utc::now());
//! // ... add operations ...
//! update.execute(false).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod batch;
pub mod context;
pub mod error;
pub mod op;
pub mod ref_update;
pub mod repo_view;
pub mod retry;

pub use batch::{
    BatchUpdate, BatchUpdateListener, ChangeResult, OnCommitValidator, Order, UpdateEngine,
};
pub use context::{ChangeContext, ChangeControl, Context, RepoContext};
pub use error::{Error, Result};
pub use op::{BatchUpdateOp, InsertChangeOp, RepoOnlyOp};
pub use ref_update::RefUpdateValidator;
pub use repo_view::{ReadOnlyRepository, RepoView};
pub use retry::{RetryConfig, RetryHelper};
