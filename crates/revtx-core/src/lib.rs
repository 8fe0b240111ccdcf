//! # revtx-core
//!
//! Core abstractions for the revtx transactional review-storage engine.
//!
//! This crate provides the foundational types and traits used across all revtx components:
//!
//! - **Identifiers**: Strongly-typed IDs for projects, changes, patch sets, and accounts
//! - **Ref Model**: Compare-and-swap ref commands and their per-command outcomes
//! - **Storage Traits**: Abstract repository and change-metadata interfaces
//! - **Index and Notify**: Post-commit secondary-index and ref-event seams
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `revtx-core` is the **only** crate allowed to define shared primitives.
//! The update engine in `revtx-update` builds on the contracts defined here.
//!
//! ## Example
//!
//! ```rust
//! use revtx_core::prelude::*;
//!
//! let project = ProjectName::new("acme/widgets").unwrap();
//! let meta_ref = RefName::change_meta(ChangeId::new(4217));
//! assert_eq!(meta_ref.as_str(), "refs/changes/17/4217/meta");
//! # let _ = project;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod change;
pub mod error;
pub mod id;
pub mod index;
pub mod meta;
pub mod notify;
pub mod observability;
pub mod refs;
pub mod repo;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use revtx_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::change::{Change, ChangeStatus};
    pub use crate::error::{Error, Result};
    pub use crate::id::{AccountId, ChangeId, PatchSetId, Principal, ProjectName};
    pub use crate::index::ChangeIndexer;
    pub use crate::meta::{MetaStore, MetaUpdate, MetaUpdateManager};
    pub use crate::notify::{RefBatchSummary, RefUpdateListener};
    pub use crate::refs::{
        CommandResult, ObjectId, PendingRefUpdates, RefCommand, RefName,
    };
    pub use crate::repo::{ObjectInserter, RepoStore, Repository, RevWalk};
}

// Re-export key types at crate root for ergonomics
pub use change::{Change, ChangeStatus};
pub use error::{Error, Result};
pub use id::{AccountId, ChangeId, PatchSetId, Principal, ProjectName};
pub use index::{ChangeIndexer, RecordingIndexer};
pub use meta::{MemoryMetaStore, MetaStore, MetaUpdate, MetaUpdateManager};
pub use notify::{NoopListener, RecordingListener, RefBatchSummary, RefUpdateListener};
pub use observability::{LogFormat, init_logging};
pub use refs::{CommandResult, ObjectId, PendingRefUpdates, RefCommand, RefName};
pub use repo::{
    MemoryRepoStore, MemoryRepository, ObjectInserter, RepoStore, Repository, RevWalk,
};
