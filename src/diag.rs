//! # Diagnostics
//!
//! Self-instrumentation for the pipeline process itself: a tracing
//! subscriber initializer plus the default bus subscribers that turn
//! pipeline events into structured log lines. This is the pipeline's
//! own exhaust, separate from the log/metric streams it ships.

use tracing::{error, warn, Level};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry,
};

use crate::bus::RuntimeMode;
use crate::core::error::PipelineResult;

/// Output format of the pipeline's own diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiagFormat {
    Json,
    #[default]
    Text,
}

/// Initialize the global tracing subscriber
///
/// Honors `RUST_LOG` when set; otherwise defaults to `info` in
/// production mode and `debug` in development. Safe to call more than
/// once (later calls are skipped, not errors).
pub fn init_diagnostics(mode: RuntimeMode, format: DiagFormat) -> PipelineResult<()> {
    let default_level = match mode {
        RuntimeMode::Production => Level::INFO,
        RuntimeMode::Development => Level::DEBUG,
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(default_level.into()));

    let already_initialized = match format {
        DiagFormat::Json => Registry::default()
            .with(env_filter)
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .try_init()
            .is_err(),
        DiagFormat::Text => Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .try_init()
            .is_err(),
    };
    if already_initialized {
        warn!("tracing subscriber already initialized, keeping the existing one");
    }
    Ok(())
}

/// Log an unrecoverable background task failure
///
/// Background loops must never take the process down; they report here
/// and the supervisor decides whether to respawn.
pub fn report_task_failure(task: &str, message: &str) {
    metrics::counter!("telemetry_task_failures_total", "task" => task.to_string()).increment(1);
    error!(task, message, "background task failed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_diagnostics(RuntimeMode::Development, DiagFormat::Text).unwrap();
        init_diagnostics(RuntimeMode::Production, DiagFormat::Json).unwrap();
    }
}
