//! # Circuit Breaker
//!
//! Per-named-circuit failure tracking consulted before any outbound
//! operation. A circuit is **Closed** (operations proceed, errors
//! counted) or **Open** (operations gated off); after `reset_timeout`
//! elapses the circuit closes again unconditionally. There is no probe
//! state: the reset is purely time-based, and a success at any point
//! force-closes immediately.
//!
//! The reset timer is a stored deadline rather than a scheduled task:
//! `is_open` applies the lazy close once the deadline passes, repeated
//! errors while open re-arm the same deadline, and `record_success`
//! cancels it. Observable behavior matches a timer without leaking
//! background tasks across shutdowns.

use std::time::{Duration, Instant};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bus::{BusEvent, EventBus};
use crate::core::error::PipelineResult;

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive errors before a circuit opens
    pub max_errors: u32,

    /// How long an open circuit stays open before the unconditional
    /// time-based reset
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,

    /// Additional circuit names treated as system circuits on top of
    /// the built-in classification
    #[serde(default)]
    pub system_circuits: Vec<String>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_errors: 3,
            reset_timeout: Duration::from_secs(60),
            system_circuits: Vec::new(),
        }
    }
}

/// Per-circuit mutable state, created lazily on first reference
#[derive(Debug, Clone)]
struct CircuitState {
    error_count: u32,
    /// Deadline of the pending time-based reset; `Some` means open
    open_until: Option<Instant>,
}

impl CircuitState {
    fn new() -> Self {
        Self { error_count: 0, open_until: None }
    }

    /// Apply the lazy time-based reset if the deadline has passed
    fn refresh(&mut self, now: Instant) {
        if let Some(deadline) = self.open_until {
            if now >= deadline {
                self.error_count = 0;
                self.open_until = None;
            }
        }
    }
}

/// Read-only view of one circuit for dashboards and tests
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub error_count: u32,
    pub is_open: bool,
}

/// Failure tracker for all named circuits in the process
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, CircuitState>,
    bus: std::sync::Arc<EventBus>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, bus: std::sync::Arc<EventBus>) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
            bus,
        }
    }

    /// Record a failure against a circuit
    ///
    /// At `max_errors` the circuit opens and the reset deadline is
    /// armed; further errors while open re-arm the same deadline rather
    /// than stacking timers. Opening emits `circuit.opened`; a handler
    /// failure during that notification is swallowed-and-logged for
    /// system circuits and propagated for business circuits, so broken
    /// internal bookkeeping never crashes business logic while
    /// business-circuit failures stay visible to the caller.
    pub fn record_error(&self, circuit: &str) -> PipelineResult<()> {
        let now = Instant::now();
        let (opened, is_open_now, error_count);
        {
            let mut state = self
                .circuits
                .entry(circuit.to_string())
                .or_insert_with(CircuitState::new);
            state.refresh(now);

            let was_open = state.open_until.is_some();
            state.error_count += 1;
            error_count = state.error_count;
            if state.error_count >= self.config.max_errors {
                state.open_until = Some(now + self.config.reset_timeout);
            }
            is_open_now = state.open_until.is_some();
            opened = !was_open && is_open_now;
        }

        metrics::gauge!("telemetry_circuit_open", "circuit" => circuit.to_string())
            .set(if is_open_now { 1.0 } else { 0.0 });

        if opened {
            debug!(circuit, error_count, "circuit opened");
            let event = BusEvent::CircuitOpened {
                circuit: circuit.to_string(),
                reason: "error threshold reached".to_string(),
                error_count,
            };
            if let Err(e) = self.bus.emit(&event) {
                if self.is_system_circuit(circuit) {
                    warn!(circuit, error = %e, "circuit.opened handler failed on system circuit");
                } else {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Record a success: error count back to zero, and an open circuit
    /// is force-closed immediately, cancelling the pending reset.
    pub fn record_success(&self, circuit: &str) -> PipelineResult<()> {
        if let Some(mut state) = self.circuits.get_mut(circuit) {
            let was_open = state.open_until.is_some();
            state.error_count = 0;
            state.open_until = None;
            if was_open {
                debug!(circuit, "circuit force-closed on success");
            }
        }
        metrics::gauge!("telemetry_circuit_open", "circuit" => circuit.to_string()).set(0.0);
        Ok(())
    }

    /// Whether a circuit is currently open. No side effects beyond the
    /// lazy time-based close.
    pub fn is_open(&self, circuit: &str) -> bool {
        match self.circuits.get_mut(circuit) {
            Some(mut state) => {
                state.refresh(Instant::now());
                state.open_until.is_some()
            }
            None => false,
        }
    }

    /// Current error count of a circuit (0 for never-referenced names)
    pub fn error_count(&self, circuit: &str) -> u32 {
        self.circuits
            .get(circuit)
            .map(|s| s.error_count)
            .unwrap_or(0)
    }

    /// Snapshot of every circuit referenced so far
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let now = Instant::now();
        self.circuits
            .iter()
            .map(|entry| CircuitSnapshot {
                name: entry.key().clone(),
                error_count: entry.value().error_count,
                is_open: entry
                    .value()
                    .open_until
                    .map(|d| now < d)
                    .unwrap_or(false),
            })
            .collect()
    }

    /// System circuits cover internal pipeline plumbing and collector
    /// API paths; everything else is a business circuit.
    pub fn is_system_circuit(&self, circuit: &str) -> bool {
        const BUILTIN: [&str; 2] = ["logs-collector", "metrics-collector"];
        BUILTIN.contains(&circuit)
            || circuit.starts_with("internal.")
            || circuit.starts_with("/api/")
            || self.config.system_circuits.iter().any(|c| c == circuit)
    }
}
