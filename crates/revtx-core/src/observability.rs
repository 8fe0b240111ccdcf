//! Observability infrastructure.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors used across the update
//! engine.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `revtx_update=debug`)
///
/// # Example
///
/// ```rust
/// use revtx_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for one storage update with standard fields.
///
/// # Example
///
/// ```rust
/// use revtx_core::observability::update_span;
///
/// let span = update_span("execute", "acme/widgets");
/// let _guard = span.enter();
/// // ... run update phases
/// ```
#[must_use]
pub fn update_span(operation: &str, project: &str) -> Span {
    tracing::info_span!("update", op = operation, project = project)
}

/// Creates a span for one retry attempt.
#[must_use]
pub fn retry_span(action: &str, attempt: u32) -> Span {
    tracing::info_span!("retry", action = action, attempt = attempt)
}
