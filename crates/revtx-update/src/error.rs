//! Error types for the update engine.

use revtx_core::refs::{CommandResult, RefName};
use thiserror::Error;

/// Result type for update-engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building or executing batch updates.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller misused the engine API (reused an update, mixed
    /// incompatible execution options, inserted the same change twice).
    #[error("caller error: {message}")]
    Caller {
        /// What the caller did wrong.
        message: String,
    },

    /// The whole batch lost a compare-and-swap race and can be retried
    /// from scratch.
    #[error("lock failure: {message}")]
    LockFailure {
        /// Which refs were contended.
        message: String,
    },

    /// The ref batch failed for a reason other than pure contention.
    /// Retrying will not help; the per-command outcomes say what happened.
    #[error("ref updates failed: {message}")]
    RefUpdateFailed {
        /// Summary of the failure.
        message: String,
        /// Every command's ref and outcome, in execution order.
        results: Vec<(RefName, CommandResult)>,
    },

    /// An operation or storage layer failed while executing the update.
    #[error("update failed: {message}")]
    UpdateFailed {
        /// What was being done.
        message: String,
        /// The underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Retries were exhausted without the action succeeding.
    #[error("retried {attempts} times over {elapsed_ms}ms without success")]
    RetryExhausted {
        /// How many attempts were made.
        attempts: u32,
        /// Wall-clock time spent, in milliseconds.
        elapsed_ms: u64,
        /// The last attempt's failure.
        #[source]
        source: Box<Error>,
    },

    /// A core storage error surfaced outside an operation callback.
    #[error(transparent)]
    Core(#[from] revtx_core::Error),
}

impl Error {
    /// Creates a caller error.
    pub fn caller(message: impl Into<String>) -> Self {
        Self::Caller {
            message: message.into(),
        }
    }

    /// Creates a lock-failure error naming the contended refs.
    pub fn lock_failure(message: impl Into<String>) -> Self {
        Self::LockFailure {
            message: message.into(),
        }
    }

    /// Wraps an operation or storage failure.
    pub fn update_failed(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::UpdateFailed {
            message: message.into(),
            source: Box::new(source),
        }
    }

    /// Returns whether this error, or any error in its source chain, is a
    /// whole-batch lock failure. Only such errors are safe to retry.
    #[must_use]
    pub fn is_lock_failure(&self) -> bool {
        match self {
            Self::LockFailure { .. } => true,
            Self::RetryExhausted { source, .. } => source.is_lock_failure(),
            Self::UpdateFailed { source, .. } => {
                let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(source.as_ref());
                while let Some(err) = cause {
                    if let Some(update_err) = err.downcast_ref::<Error>() {
                        return update_err.is_lock_failure();
                    }
                    cause = err.source();
                }
                false
            }
            _ => false,
        }
    }
}
