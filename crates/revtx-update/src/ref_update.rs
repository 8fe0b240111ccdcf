//! Execution and failure classification of staged ref batches.
//!
//! All ref commands staged by one update go through
//! [`RefUpdateValidator::execute`], which runs them against the repository
//! and classifies any failure as either retryable contention or a fatal
//! error.

use revtx_core::notify::RefBatchSummary;
use revtx_core::refs::{CommandResult, PendingRefUpdates};
use revtx_core::repo::Repository;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Executes staged ref batches and classifies their outcomes.
pub struct RefUpdateValidator;

impl RefUpdateValidator {
    /// Executes a staged ref batch and classifies the outcome.
    ///
    /// An empty batch succeeds without touching the repository. In dry-run
    /// mode every command is reported as applied but nothing executes.
    ///
    /// A failed batch is retryable only when every failing command failed
    /// for pure contention (it lost the compare-and-swap race or was
    /// aborted by a sibling that did) and nothing was partially applied.
    /// Anything else is fatal and carries the full per-command outcomes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockFailure`] for a retryable batch and
    /// [`Error::RefUpdateFailed`] for a fatal one.
    pub async fn execute(
        repo: &dyn Repository,
        ref_log_message: &str,
        commands: &PendingRefUpdates,
        dry_run: bool,
    ) -> Result<RefBatchSummary> {
        let project = repo.project().clone();
        if commands.is_empty() {
            return Ok(RefBatchSummary::empty(project, ref_log_message.to_string()));
        }

        if dry_run {
            debug!(project = %project, commands = commands.len(), "dry run, skipping ref batch");
            return Ok(RefBatchSummary {
                project,
                ref_log_message: ref_log_message.to_string(),
                commands: commands
                    .commands()
                    .iter()
                    .map(|cmd| (cmd.clone(), CommandResult::Ok))
                    .collect(),
            });
        }

        let results = repo.execute_batch(commands.commands()).await?;
        let summary = RefBatchSummary {
            project,
            ref_log_message: ref_log_message.to_string(),
            commands: commands
                .commands()
                .iter()
                .cloned()
                .zip(results)
                .collect(),
        };

        if summary.all_ok() {
            debug!(
                project = %summary.project,
                commands = summary.commands.len(),
                "ref batch committed"
            );
            return Ok(summary);
        }

        let failures: Vec<_> = summary
            .commands
            .iter()
            .filter(|(_, result)| !result.is_ok())
            .collect();
        let only_contention = failures
            .iter()
            .all(|(_, result)| result.is_lock_contention());
        // A partial application can only happen on a non-atomic backend; a
        // batch that half-applied must not be retried from scratch.
        let partially_applied = !repo.supports_atomic_batch()
            && summary.commands.iter().any(|(_, result)| result.is_ok());

        if only_contention && !partially_applied {
            let contended: Vec<_> = failures
                .iter()
                .filter(|(_, result)| matches!(result, CommandResult::LockFailure))
                .map(|(cmd, _)| cmd.name.to_string())
                .collect();
            debug!(
                project = %summary.project,
                refs = ?contended,
                "ref batch lost compare-and-swap race"
            );
            return Err(Error::lock_failure(contended.join(", ")));
        }

        warn!(
            project = %summary.project,
            failures = failures.len(),
            "ref batch failed"
        );
        let message = failures
            .iter()
            .map(|(cmd, result)| format!("{}: {result}", cmd.name))
            .collect::<Vec<_>>()
            .join("; ");
        Err(Error::RefUpdateFailed {
            message,
            results: summary
                .commands
                .iter()
                .map(|(cmd, result)| (cmd.name.clone(), result.clone()))
                .collect(),
        })
    }
}
