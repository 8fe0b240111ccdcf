//! Post-commit ref notifications.
//!
//! After a ref batch commits, a summary of what actually changed is handed
//! to registered listeners. Listener dispatch is synchronous and infallible;
//! a listener that needs to do slow work hands it off itself.

use std::sync::Mutex;

use crate::id::{AccountId, ProjectName};
use crate::refs::{CommandResult, RefCommand, RefName};

/// What one executed ref batch did, command by command.
#[derive(Debug, Clone)]
pub struct RefBatchSummary {
    /// Project the batch was executed against.
    pub project: ProjectName,
    /// Message recorded in the ref log for every applied command.
    pub ref_log_message: String,
    /// Every staged command paired with its outcome, in execution order.
    pub commands: Vec<(RefCommand, CommandResult)>,
}

impl RefBatchSummary {
    /// Creates an empty summary for a project.
    #[must_use]
    pub fn empty(project: ProjectName, ref_log_message: String) -> Self {
        Self {
            project,
            ref_log_message,
            commands: Vec::new(),
        }
    }

    /// Returns the names of refs whose commands were applied.
    #[must_use]
    pub fn succeeded(&self) -> Vec<&RefName> {
        self.commands
            .iter()
            .filter(|(_, result)| result.is_ok())
            .map(|(cmd, _)| &cmd.name)
            .collect()
    }

    /// Returns whether every command in the batch was applied.
    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.commands.iter().all(|(_, result)| result.is_ok())
    }

    /// Returns whether the batch contained any commands.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Receives notification of committed ref updates.
pub trait RefUpdateListener: Send + Sync {
    /// Called once per executed batch, after commit, with the acting
    /// account if the update ran on behalf of a user.
    fn fire(&self, summary: &RefBatchSummary, account: Option<AccountId>);
}

/// Listener that ignores every notification.
#[derive(Debug, Default)]
pub struct NoopListener;

impl RefUpdateListener for NoopListener {
    fn fire(&self, _summary: &RefBatchSummary, _account: Option<AccountId>) {}
}

/// Test listener that records every notification.
#[derive(Default)]
pub struct RecordingListener {
    fired: Mutex<Vec<(RefBatchSummary, Option<AccountId>)>>,
}

impl RecordingListener {
    /// Creates an empty recording listener.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded notifications.
    #[must_use]
    pub fn fired(&self) -> Vec<(RefBatchSummary, Option<AccountId>)> {
        match self.fired.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl RefUpdateListener for RecordingListener {
    fn fire(&self, summary: &RefBatchSummary, account: Option<AccountId>) {
        let mut fired = match self.fired.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        fired.push((summary.clone(), account));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::ObjectId;

    #[test]
    fn test_summary_filters_succeeded() {
        let ok_ref = RefName::new("refs/heads/ok").unwrap();
        let lost_ref = RefName::new("refs/heads/lost").unwrap();
        let summary = RefBatchSummary {
            project: ProjectName::new("demo").unwrap(),
            ref_log_message: "update".to_string(),
            commands: vec![
                (
                    RefCommand::create(ok_ref.clone(), ObjectId::hash(b"a")),
                    CommandResult::Ok,
                ),
                (
                    RefCommand::create(lost_ref, ObjectId::hash(b"b")),
                    CommandResult::LockFailure,
                ),
            ],
        };

        assert_eq!(summary.succeeded(), vec![&ok_ref]);
        assert!(!summary.all_ok());
    }

    #[test]
    fn test_recording_listener() {
        let listener = RecordingListener::new();
        let summary =
            RefBatchSummary::empty(ProjectName::new("demo").unwrap(), "msg".to_string());
        listener.fire(&summary, Some(AccountId::new(1000)));

        let fired = listener.fired();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, Some(AccountId::new(1000)));
    }
}
