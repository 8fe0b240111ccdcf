//! The change entity: one reviewable unit of work and its lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{AccountId, ChangeId, PatchSetId, ProjectName};

/// Lifecycle state of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeStatus {
    /// Open and under review.
    New,
    /// Submitted to the destination branch.
    Merged,
    /// Closed without submission.
    Abandoned,
}

impl ChangeStatus {
    /// Returns whether the change is still open.
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::New)
    }
}

/// A reviewable unit of work.
///
/// The authoritative record lives in the change's metadata ref; this struct
/// is the materialized view the engine reads and rewrites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Stable change number.
    pub id: ChangeId,
    /// Project the change targets.
    pub project: ProjectName,
    /// Destination branch ref.
    pub branch: String,
    /// Account that owns the change.
    pub owner: AccountId,
    /// Lifecycle state.
    pub status: ChangeStatus,
    /// One-line summary from the latest patch set.
    pub subject: String,
    /// When the change was created.
    pub created_on: DateTime<Utc>,
    /// When the change was last modified.
    pub last_updated_on: DateTime<Utc>,
    /// The patch set currently under review, if any.
    pub current_patch_set: Option<PatchSetId>,
}

impl Change {
    /// Creates a new open change.
    #[must_use]
    pub fn new(
        id: ChangeId,
        project: ProjectName,
        branch: impl Into<String>,
        owner: AccountId,
        subject: impl Into<String>,
        created_on: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            project,
            branch: branch.into(),
            owner,
            status: ChangeStatus::New,
            subject: subject.into(),
            created_on,
            last_updated_on: created_on,
            current_patch_set: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_change_is_open() {
        let change = Change::new(
            ChangeId::new(1),
            ProjectName::new("demo").unwrap(),
            "refs/heads/main",
            AccountId::new(1000),
            "Initial work",
            Utc::now(),
        );
        assert!(change.status.is_open());
        assert_eq!(change.current_patch_set, None);
        assert_eq!(change.created_on, change.last_updated_on);
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&ChangeStatus::Merged).unwrap();
        assert_eq!(json, "\"merged\"");
    }
}
