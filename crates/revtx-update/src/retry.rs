//! Retrying of contended batch updates.
//!
//! When every change write in a batch rides the same ref transaction, a
//! lost compare-and-swap race leaves nothing applied and the whole action
//! can simply be rebuilt and rerun. [`RetryHelper`] does that: capped
//! exponential backoff with jitter, bounded by wall-clock time, retrying
//! only errors classified as whole-batch lock failures.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use revtx_core::observability::retry_span;
use serde::Deserialize;
use tracing::{debug, Instrument};

use crate::batch::UpdateEngine;
use crate::error::{Error, Result};

/// Tuning for [`RetryHelper`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Whether change writes are fused into the ref transaction. Only a
    /// fused deployment may retry a lock failure; in split mode a lost
    /// race can leave partial state behind.
    pub fused: bool,
    /// Total wall-clock budget across attempts, in milliseconds.
    pub max_wait_ms: u64,
    /// First backoff delay, in milliseconds. Doubles each attempt.
    pub backoff_base_ms: u64,
    /// Upper bound on the backoff delay, in milliseconds.
    pub backoff_cap_ms: u64,
    /// Upper bound on the random jitter, in milliseconds.
    pub jitter_cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            fused: true,
            max_wait_ms: 10_000,
            backoff_base_ms: 100,
            backoff_cap_ms: 2_000,
            jitter_cap_ms: 50,
        }
    }
}

/// Re-executes contended update actions until they stick or the time
/// budget runs out.
pub struct RetryHelper {
    engine: Arc<UpdateEngine>,
    config: RetryConfig,
}

impl RetryHelper {
    /// Creates a helper over an engine.
    #[must_use]
    pub fn new(engine: Arc<UpdateEngine>, config: RetryConfig) -> Self {
        Self { engine, config }
    }

    /// Returns the engine actions run against.
    #[must_use]
    pub fn engine(&self) -> &Arc<UpdateEngine> {
        &self.engine
    }

    /// Runs an action, retrying whole-batch lock failures.
    ///
    /// The action is invoked with the engine and must build its updates
    /// from scratch on every attempt; a [`BatchUpdate`] cannot be reused
    /// after execution.
    ///
    /// [`BatchUpdate`]: crate::batch::BatchUpdate
    ///
    /// # Errors
    ///
    /// Non-retryable errors are returned as-is from the failing attempt.
    /// When the time budget is exhausted the last lock failure is wrapped
    /// in [`Error::RetryExhausted`].
    pub async fn execute<F, Fut, T>(&self, action_name: &str, action: F) -> Result<T>
    where
        F: Fn(Arc<UpdateEngine>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 1;
        loop {
            let span = retry_span(action_name, attempt);
            let result = action(Arc::clone(&self.engine)).instrument(span).await;
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !self.config.fused || !err.is_lock_failure() {
                return Err(err);
            }

            let elapsed = started.elapsed();
            if elapsed.as_millis() as u64 >= self.config.max_wait_ms {
                return Err(Error::RetryExhausted {
                    attempts: attempt,
                    elapsed_ms: elapsed.as_millis() as u64,
                    source: Box::new(err),
                });
            }

            let delay = self.delay(attempt);
            debug!(
                action = action_name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying contended update"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Backoff doubles per attempt up to the cap; jitter keeps herds of
    /// writers losing the same race from waking in lockstep.
    fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let backoff = self
            .config
            .backoff_base_ms
            .saturating_mul(1_u64 << exp)
            .min(self.config.backoff_cap_ms);
        Duration::from_millis(backoff.max(jitter_ms(self.config.jitter_cap_ms)))
    }
}

fn jitter_ms(cap: u64) -> u64 {
    if cap == 0 {
        return 0;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    u64::from(nanos) % cap
}
