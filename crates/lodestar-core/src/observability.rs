//! Observability infrastructure for Lodestar.
//!
//! Structured logging with consistent spans. Store operations, convergence
//! cycles and leadership changes all log through `tracing` with the span
//! helpers below so log lines can be correlated by operation and cycle.

use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Error;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(Error::configuration(format!("unknown log format: {other}"))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `lodestar_state=debug`)
///
/// # Example
///
/// ```rust
/// use lodestar_core::observability::{init_logging, LogFormat};
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

/// Creates a span for record store operations.
#[must_use]
pub fn store_span(operation: &str, backend: &str) -> Span {
    tracing::info_span!("store", op = operation, backend = backend)
}

/// Creates a span for one convergence cycle.
///
/// # Example
///
/// ```rust
/// use lodestar_core::observability::convergence_span;
///
/// let span = convergence_span(7);
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn convergence_span(cycle: u64) -> Span {
    tracing::info_span!("convergence", cycle = cycle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_succeeds() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn log_format_parses() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_span_helper_creates_span() {
        let span = store_span("desire_lrp", "sql");
        let _guard = span.enter();
        tracing::info!("test message in span");
    }
}
