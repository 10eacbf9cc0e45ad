//! # Typed Event Bus
//!
//! Process-wide publish/subscribe hub. Pipeline components never call
//! each other for cross-cutting notifications; they emit [`BusEvent`]s
//! and observers subscribe by [`EventKind`].
//!
//! Dispatch is synchronous and ordered: handlers run in registration
//! order and the first handler error propagates to the `emit` caller
//! (earlier siblings have already run by then).
//!
//! In production mode, high-frequency system events are suppressed
//! unless they are critical or carry an error/failed name. This is a
//! noise-reduction policy for downstream subscribers, not a correctness
//! mechanism, and is driven entirely by the configured runtime mode.

use std::collections::HashMap;
use std::fmt;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::trace;

use crate::core::error::{PipelineError, PipelineResult};

/// Runtime mode controlling event suppression
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    Development,
    Production,
}

impl Default for RuntimeMode {
    fn default() -> Self {
        RuntimeMode::Development
    }
}

/// Why an entry was dropped instead of queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The gating circuit was open; queuing during an outage is how
    /// queues explode
    CircuitOpen,
    /// The queue was at its configured bound
    QueueFull,
    /// A re-enqueued failed batch pushed the queue past its bound
    QueueOverflow,
    /// The sampler excluded the entry
    Sampled,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit-open",
            Self::QueueFull => "queue-full",
            Self::QueueOverflow => "queue-overflow",
            Self::Sampled => "sampled",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which entry stream a persister event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Logs,
    Metrics,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logs => "logs",
            Self::Metrics => "metrics",
        }
    }
}

/// What caused a metrics window rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationTrigger {
    /// The background window timer fired
    Timer,
    /// The current window hit its distinct-key bound
    Cardinality,
}

/// All events the pipeline emits
///
/// A sum type instead of string-keyed names: every payload is
/// strongly typed and the registry is keyed by [`EventKind`].
#[derive(Debug, Clone)]
pub enum BusEvent {
    LogQueued { queue_len: usize },
    LogBatchFull { key: String, size_bytes: usize },
    LogBatchRotated { key: String, entry_count: usize, size_bytes: usize },
    LogsFlushed { count: usize },
    LogDropped { reason: DropReason, count: usize },
    MetricQueued { queue_len: usize },
    MetricsFlushed { count: usize },
    MetricDropped { reason: DropReason, count: usize },
    MetricsWindowRotated { trigger: RotationTrigger, rotated_keys: usize },
    CircuitOpened { circuit: String, reason: String, error_count: u32 },
    ErrorOccurred {
        error_type: String,
        message: String,
        reference: String,
        metadata: Value,
    },
    SystemCleanup,
    /// Application-defined event; never part of the system namespaces
    Custom { name: String, payload: Value },
}

impl BusEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::LogQueued { .. } => EventKind::LogQueued,
            Self::LogBatchFull { .. } => EventKind::LogBatchFull,
            Self::LogBatchRotated { .. } => EventKind::LogBatchRotated,
            Self::LogsFlushed { .. } => EventKind::LogsFlushed,
            Self::LogDropped { .. } => EventKind::LogDropped,
            Self::MetricQueued { .. } => EventKind::MetricQueued,
            Self::MetricsFlushed { .. } => EventKind::MetricsFlushed,
            Self::MetricDropped { .. } => EventKind::MetricDropped,
            Self::MetricsWindowRotated { .. } => EventKind::MetricsWindowRotated,
            Self::CircuitOpened { .. } => EventKind::CircuitOpened,
            Self::ErrorOccurred { .. } => EventKind::ErrorOccurred,
            Self::SystemCleanup => EventKind::SystemCleanup,
            Self::Custom { name, .. } => EventKind::Custom(name.clone()),
        }
    }

    /// Critical events bypass production suppression
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpened { .. } | Self::ErrorOccurred { .. }
        )
    }
}

/// Registry key for event subscriptions
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    LogQueued,
    LogBatchFull,
    LogBatchRotated,
    LogsFlushed,
    LogDropped,
    MetricQueued,
    MetricsFlushed,
    MetricDropped,
    MetricsWindowRotated,
    CircuitOpened,
    ErrorOccurred,
    SystemCleanup,
    Custom(String),
}

impl EventKind {
    /// Canonical dotted name, used for diagnostics and the suppression
    /// policy
    pub fn name(&self) -> &str {
        match self {
            Self::LogQueued => "log.queued",
            Self::LogBatchFull => "log.batch.full",
            Self::LogBatchRotated => "log.batch.rotated",
            Self::LogsFlushed => "logs.flushed",
            Self::LogDropped => "log.dropped",
            Self::MetricQueued => "metric.queued",
            Self::MetricsFlushed => "metrics.flushed",
            Self::MetricDropped => "metric.dropped",
            Self::MetricsWindowRotated => "metrics.window.rotated",
            Self::CircuitOpened => "circuit.opened",
            Self::ErrorOccurred => "error.occurred",
            Self::SystemCleanup => "system.cleanup",
            Self::Custom(name) => name,
        }
    }

    /// System namespaces: `log.*`, `logs.*`, `metric.*`, `metrics.*`,
    /// `circuit.*`, `monitor.*`, `system.*`
    pub fn is_system(&self) -> bool {
        const SYSTEM_PREFIXES: [&str; 7] =
            ["log.", "logs.", "metric.", "metrics.", "circuit.", "monitor.", "system."];
        let name = self.name();
        SYSTEM_PREFIXES.iter().any(|p| name.starts_with(p))
    }
}

/// Boxed synchronous event handler
pub type EventHandler = Box<dyn Fn(&BusEvent) -> PipelineResult<()> + Send + Sync>;

/// Process-wide publish/subscribe hub
pub struct EventBus {
    mode: RuntimeMode,
    handlers: RwLock<HashMap<EventKind, Vec<EventHandler>>>,
}

impl EventBus {
    pub fn new(mode: RuntimeMode) -> Self {
        Self {
            mode,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    /// Register a handler for an event kind
    ///
    /// Many handlers may observe one kind; invocation order is
    /// registration order.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&BusEvent) -> PipelineResult<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Box::new(handler));
    }

    /// Emit an event to every registered handler, in order
    ///
    /// Returns the first handler error; handlers registered before the
    /// failing one have already run. Events with no subscribers are a
    /// successful no-op.
    pub fn emit(&self, event: &BusEvent) -> PipelineResult<()> {
        if self.is_suppressed(event) {
            trace!(event = event.kind().name(), "suppressed system event");
            return Ok(());
        }

        let kind = event.kind();
        let handlers = self.handlers.read();
        if let Some(registered) = handlers.get(&kind) {
            for handler in registered {
                handler(event).map_err(|e| PipelineError::EventHandler {
                    event: kind.name().to_string(),
                    message: e.to_string(),
                })?;
            }
        }
        Ok(())
    }

    /// Number of handlers registered for a kind (test/introspection aid)
    pub fn handler_count(&self, kind: &EventKind) -> usize {
        self.handlers.read().get(kind).map_or(0, Vec::len)
    }

    /// Drop every registered handler
    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    /// Suppression policy: production mode silences system-namespaced
    /// chatter unless the event is critical or its name carries
    /// `error`/`failed`.
    fn is_suppressed(&self, event: &BusEvent) -> bool {
        if self.mode != RuntimeMode::Production {
            return false;
        }
        let kind = event.kind();
        if !kind.is_system() || event.is_critical() {
            return false;
        }
        let name = kind.name();
        !(name.contains("error") || name.contains("failed"))
    }
}
