//! # Error Manager
//!
//! Classifies every raised failure into a closed four-way taxonomy
//! (`system`, `security`, `business`, `integration`), maps it to
//! user-safe messages and routes it onto the event bus as
//! `error.occurred`. The manager is the single seam guaranteed never to
//! throw outward: in the worst case [`ErrorManager::handle`] returns a
//! generic fallback response and reports its own failure as an event.

use std::collections::HashMap;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::bus::{BusEvent, EventBus};
use crate::core::circuit_breaker::CircuitBreaker;
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::types::{generate_reference, to_base36, LogLevel};

/// Top-level error categories; the taxonomy is closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    System,
    Security,
    Business,
    Integration,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Security => "security",
            Self::Business => "business",
            Self::Integration => "integration",
        }
    }

    /// Generic user message used when a code has no registered template
    fn generic_message(&self) -> &'static str {
        match self {
            Self::System => "An internal error occurred. Please try again later.",
            Self::Security => "The request could not be authorized.",
            Self::Business => "The request could not be completed.",
            Self::Integration => "A downstream service is currently unavailable.",
        }
    }
}

/// Severity-dependent message templates for one error code
#[derive(Debug, Clone, Copy)]
struct MessageSet {
    error: &'static str,
    warn: &'static str,
    info: &'static str,
}

impl MessageSet {
    fn for_level(&self, level: LogLevel) -> &'static str {
        match level {
            LogLevel::Error => self.error,
            LogLevel::Warn => self.warn,
            LogLevel::Info | LogLevel::Debug => self.info,
        }
    }
}

/// One concrete error type within a category
#[derive(Debug, Clone, Copy)]
struct ErrorDefinition {
    component: &'static str,
    action: &'static str,
    status_code: u16,
    messages: MessageSet,
}

/// A classified error with correlation reference and safe metadata
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaisedError {
    pub category: ErrorCategory,
    pub code: String,
    /// Stable `category/component/code` tag
    pub error_type: String,
    pub message: String,
    /// `CATEGORY_COMPONENT_ACTION_<base36-timestamp>` correlation key
    pub reference: String,
    pub status_code: u16,
    pub metadata: HashMap<String, Value>,
    pub tenant_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Minimal response safe to hand back to clients
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub user_message: String,
    pub error_type: String,
    pub status_code: u16,
    pub error_reference: String,
    pub metadata: HashMap<String, Value>,
    pub tenant_id: Option<String>,
}

/// Anything the manager can normalize into the taxonomy
#[derive(Debug, Clone)]
pub enum Failure {
    Raised(RaisedError),
    Pipeline(PipelineError),
    Message(String),
}

impl From<RaisedError> for Failure {
    fn from(e: RaisedError) -> Self {
        Self::Raised(e)
    }
}

impl From<PipelineError> for Failure {
    fn from(e: PipelineError) -> Self {
        Self::Pipeline(e)
    }
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Self::Message(message)
    }
}

impl From<&str> for Failure {
    fn from(message: &str) -> Self {
        Self::Message(message.to_string())
    }
}

/// Error classification, reporting and best-effort recovery
pub struct ErrorManager {
    bus: Arc<EventBus>,
    breaker: Arc<CircuitBreaker>,
    catalog: HashMap<ErrorCategory, HashMap<&'static str, ErrorDefinition>>,
}

impl ErrorManager {
    pub fn new(bus: Arc<EventBus>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            bus,
            breaker,
            catalog: build_catalog(),
        }
    }

    /// Create a classified error; never fails the caller
    ///
    /// Unknown codes fall back to a generated unknown error of the same
    /// category instead of erroring.
    pub fn create_error(
        &self,
        category: ErrorCategory,
        code: &str,
        message: Option<String>,
        metadata: Option<HashMap<String, Value>>,
        tenant_id: Option<String>,
    ) -> RaisedError {
        let (code, definition) = match self.catalog.get(&category).and_then(|codes| {
            codes
                .get_key_value(code)
                .map(|(k, v)| (k.to_string(), *v))
        }) {
            Some((known, definition)) => (known, definition),
            None => (
                "unknown_error".to_string(),
                ErrorDefinition {
                    component: "general",
                    action: "unknown",
                    status_code: 500,
                    messages: MessageSet {
                        error: "An unexpected error occurred",
                        warn: "An unexpected condition was detected",
                        info: "An unexpected event was recorded",
                    },
                },
            ),
        };

        let reference = generate_reference(&format!(
            "{}_{}_{}",
            category.as_str(),
            definition.component,
            definition.action
        ));

        RaisedError {
            category,
            error_type: format!("{}/{}/{}", category.as_str(), definition.component, code),
            message: message.unwrap_or_else(|| definition.messages.error.to_string()),
            reference,
            status_code: definition.status_code,
            metadata: metadata.unwrap_or_default(),
            tenant_id,
            code,
            timestamp: Utc::now(),
        }
    }

    /// Resolve the user-safe message for a code at a given log level,
    /// defaulting to the category's generic message.
    pub fn user_message(&self, category: ErrorCategory, code: &str, level: LogLevel) -> String {
        self.catalog
            .get(&category)
            .and_then(|codes| codes.get(code))
            .map(|d| d.messages.for_level(level).to_string())
            .unwrap_or_else(|| category.generic_message().to_string())
    }

    /// Normalize any failure, report it on the bus and return a
    /// client-safe response.
    ///
    /// This method never fails: an internal failure while handling
    /// produces a generic fallback response referenced
    /// `SYSTEM_ERROR_HANDLING_FAILED_<ts>`, and the inner failure is
    /// itself emitted best-effort.
    pub fn handle(&self, failure: impl Into<Failure>) -> ErrorResponse {
        let failure = failure.into();
        match self.try_handle(failure) {
            Ok(response) => response,
            Err(inner) => self.fallback_response(inner),
        }
    }

    /// Best-effort recovery for circuit-breaker-tagged errors
    ///
    /// Resets the referenced circuit via `record_success`. Returns
    /// whether recovery was attempted; internal failures yield `false`
    /// rather than an error.
    pub fn attempt_recovery(&self, error: &RaisedError) -> bool {
        let circuit = error
            .metadata
            .get("circuit")
            .and_then(Value::as_str)
            .map(str::to_string);

        match circuit {
            Some(circuit) if error.code == "circuit_open" || error.category == ErrorCategory::Integration => {
                self.breaker.record_success(&circuit).is_ok()
            }
            _ => false,
        }
    }

    fn try_handle(&self, failure: Failure) -> PipelineResult<ErrorResponse> {
        let error = self.normalize(failure);

        let mut event_metadata = error.metadata.clone();
        event_metadata.insert("correlationId".to_string(), json!(Uuid::new_v4().to_string()));
        event_metadata.insert("category".to_string(), json!(error.category.as_str()));
        event_metadata.insert("statusCode".to_string(), json!(error.status_code));
        event_metadata.insert("timestamp".to_string(), json!(error.timestamp.to_rfc3339()));

        self.bus.emit(&BusEvent::ErrorOccurred {
            error_type: error.error_type.clone(),
            message: error.message.clone(),
            reference: error.reference.clone(),
            metadata: Value::Object(event_metadata.clone().into_iter().collect()),
        })?;

        metrics::counter!(
            "telemetry_errors_total",
            "category" => error.category.as_str().to_string()
        )
        .increment(1);

        Ok(ErrorResponse {
            user_message: self.user_message(error.category, &error.code, LogLevel::Error),
            error_type: error.error_type,
            status_code: error.status_code,
            error_reference: error.reference,
            metadata: error.metadata,
            tenant_id: error.tenant_id,
        })
    }

    /// Idempotent normalization: already-classified errors pass
    /// through, pipeline errors map onto the taxonomy, bare messages
    /// wrap as `system/unknown_error`.
    fn normalize(&self, failure: Failure) -> RaisedError {
        match failure {
            Failure::Raised(error) => error,
            Failure::Message(message) => self.create_error(
                ErrorCategory::System,
                "unknown_error",
                Some(message),
                None,
                None,
            ),
            Failure::Pipeline(error) => {
                let message = error.to_string();
                let (category, code, metadata) = match &error {
                    PipelineError::CircuitOpen { circuit } => (
                        ErrorCategory::Integration,
                        "circuit_open",
                        Some(HashMap::from([("circuit".to_string(), json!(circuit))])),
                    ),
                    PipelineError::QueueFull { stream, limit } => (
                        ErrorCategory::System,
                        "queue_full",
                        Some(HashMap::from([
                            ("stream".to_string(), json!(stream)),
                            ("limit".to_string(), json!(limit)),
                        ])),
                    ),
                    PipelineError::Transport { .. } => {
                        (ErrorCategory::Integration, "transport_failed", None)
                    }
                    PipelineError::RetryExhausted { attempts, .. } => (
                        ErrorCategory::Integration,
                        "retry_exhausted",
                        Some(HashMap::from([("attempts".to_string(), json!(attempts))])),
                    ),
                    PipelineError::Aggregation { .. } | PipelineError::Serialization { .. } => {
                        (ErrorCategory::System, "aggregation_failed", None)
                    }
                    _ => (ErrorCategory::System, "unknown_error", None),
                };
                self.create_error(category, code, Some(message), metadata, None)
            }
        }
    }

    fn fallback_response(&self, inner: PipelineError) -> ErrorResponse {
        warn!(error = %inner, "error handling failed; returning fallback response");
        let reference = format!(
            "SYSTEM_ERROR_HANDLING_FAILED_{}",
            to_base36(Utc::now().timestamp_millis().max(0) as u128)
        );

        // Best-effort: report the handler failure itself, ignoring a
        // second failure.
        let _ = self.bus.emit(&BusEvent::ErrorOccurred {
            error_type: "system/error/error_handling_failed".to_string(),
            message: inner.to_string(),
            reference: reference.clone(),
            metadata: json!({ "fallback": true }),
        });

        ErrorResponse {
            user_message: ErrorCategory::System.generic_message().to_string(),
            error_type: "system/error/error_handling_failed".to_string(),
            status_code: 500,
            error_reference: reference,
            metadata: HashMap::new(),
            tenant_id: None,
        }
    }
}

/// The closed code catalog, one table per category
fn build_catalog() -> HashMap<ErrorCategory, HashMap<&'static str, ErrorDefinition>> {
    let mut catalog = HashMap::new();

    catalog.insert(
        ErrorCategory::System,
        HashMap::from([
            (
                "unknown_error",
                ErrorDefinition {
                    component: "general",
                    action: "unknown",
                    status_code: 500,
                    messages: MessageSet {
                        error: "An unexpected error occurred",
                        warn: "An unexpected condition was detected",
                        info: "An unexpected event was recorded",
                    },
                },
            ),
            (
                "queue_full",
                ErrorDefinition {
                    component: "persister",
                    action: "enqueue",
                    status_code: 503,
                    messages: MessageSet {
                        error: "Telemetry buffering is saturated; the entry was dropped",
                        warn: "Telemetry buffering is close to saturation",
                        info: "Telemetry buffering reported its queue length",
                    },
                },
            ),
            (
                "aggregation_failed",
                ErrorDefinition {
                    component: "aggregator",
                    action: "aggregate",
                    status_code: 500,
                    messages: MessageSet {
                        error: "The entry could not be aggregated",
                        warn: "Aggregation encountered a recoverable problem",
                        info: "Aggregation reported a condition",
                    },
                },
            ),
            (
                "error_handling_failed",
                ErrorDefinition {
                    component: "error",
                    action: "handling",
                    status_code: 500,
                    messages: MessageSet {
                        error: "Error reporting failed",
                        warn: "Error reporting degraded",
                        info: "Error reporting notice",
                    },
                },
            ),
        ]),
    );

    catalog.insert(
        ErrorCategory::Security,
        HashMap::from([
            (
                "unauthorized",
                ErrorDefinition {
                    component: "auth",
                    action: "verify",
                    status_code: 401,
                    messages: MessageSet {
                        error: "Authentication is required",
                        warn: "Authentication is expiring",
                        info: "Authentication event recorded",
                    },
                },
            ),
            (
                "forbidden",
                ErrorDefinition {
                    component: "auth",
                    action: "authorize",
                    status_code: 403,
                    messages: MessageSet {
                        error: "Access to this resource is denied",
                        warn: "Access policy warning",
                        info: "Access policy event recorded",
                    },
                },
            ),
            (
                "rate_limited",
                ErrorDefinition {
                    component: "throttle",
                    action: "admit",
                    status_code: 429,
                    messages: MessageSet {
                        error: "Too many requests; please slow down",
                        warn: "Request rate is approaching the limit",
                        info: "Request rate event recorded",
                    },
                },
            ),
        ]),
    );

    catalog.insert(
        ErrorCategory::Business,
        HashMap::from([
            (
                "validation_failed",
                ErrorDefinition {
                    component: "validation",
                    action: "check",
                    status_code: 422,
                    messages: MessageSet {
                        error: "The submitted data is invalid",
                        warn: "The submitted data is partially invalid",
                        info: "Validation event recorded",
                    },
                },
            ),
            (
                "not_found",
                ErrorDefinition {
                    component: "lookup",
                    action: "fetch",
                    status_code: 404,
                    messages: MessageSet {
                        error: "The requested item was not found",
                        warn: "A referenced item is missing",
                        info: "Lookup event recorded",
                    },
                },
            ),
            (
                "conflict",
                ErrorDefinition {
                    component: "state",
                    action: "update",
                    status_code: 409,
                    messages: MessageSet {
                        error: "The item was modified by someone else",
                        warn: "A concurrent modification was detected",
                        info: "State event recorded",
                    },
                },
            ),
        ]),
    );

    catalog.insert(
        ErrorCategory::Integration,
        HashMap::from([
            (
                "circuit_open",
                ErrorDefinition {
                    component: "circuit",
                    action: "gate",
                    status_code: 503,
                    messages: MessageSet {
                        error: "A downstream service is temporarily unavailable",
                        warn: "A downstream service is degraded",
                        info: "Circuit state event recorded",
                    },
                },
            ),
            (
                "transport_failed",
                ErrorDefinition {
                    component: "transport",
                    action: "send",
                    status_code: 502,
                    messages: MessageSet {
                        error: "Delivery to the collector failed",
                        warn: "Delivery to the collector is degraded",
                        info: "Delivery event recorded",
                    },
                },
            ),
            (
                "retry_exhausted",
                ErrorDefinition {
                    component: "transport",
                    action: "retry",
                    status_code: 502,
                    messages: MessageSet {
                        error: "Delivery failed after all retries",
                        warn: "Delivery retries are accumulating",
                        info: "Delivery retry event recorded",
                    },
                },
            ),
            (
                "collector_rejected",
                ErrorDefinition {
                    component: "collector",
                    action: "accept",
                    status_code: 502,
                    messages: MessageSet {
                        error: "The collector rejected the payload",
                        warn: "The collector flagged the payload",
                        info: "Collector response event recorded",
                    },
                },
            ),
        ]),
    );

    catalog
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventKind, RuntimeMode};
    use crate::core::circuit_breaker::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> (ErrorManager, Arc<EventBus>, Arc<CircuitBreaker>) {
        let bus = Arc::new(EventBus::new(RuntimeMode::Development));
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::default(),
            Arc::clone(&bus),
        ));
        (
            ErrorManager::new(Arc::clone(&bus), Arc::clone(&breaker)),
            bus,
            breaker,
        )
    }

    #[test]
    fn create_error_builds_reference_from_catalog() {
        let (manager, _, _) = manager();
        let error = manager.create_error(
            ErrorCategory::Integration,
            "transport_failed",
            None,
            None,
            Some("tenant-9".to_string()),
        );

        assert!(error.reference.starts_with("INTEGRATION_TRANSPORT_SEND_"));
        assert_eq!(error.status_code, 502);
        assert_eq!(error.error_type, "integration/transport/transport_failed");
        assert_eq!(error.tenant_id.as_deref(), Some("tenant-9"));
    }

    #[test]
    fn unknown_code_falls_back_instead_of_failing() {
        let (manager, _, _) = manager();
        let error = manager.create_error(
            ErrorCategory::Business,
            "no_such_code",
            None,
            None,
            None,
        );

        assert_eq!(error.code, "unknown_error");
        assert_eq!(error.status_code, 500);
        assert!(error.reference.starts_with("BUSINESS_GENERAL_UNKNOWN_"));
    }

    #[test]
    fn handle_emits_error_occurred_and_returns_safe_response() {
        let (manager, bus, _) = manager();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        bus.on(EventKind::ErrorOccurred, move |event| {
            if let BusEvent::ErrorOccurred { metadata, .. } = event {
                assert!(metadata.get("correlationId").is_some());
            }
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let response = manager.handle(PipelineError::transport("collector down"));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(response.status_code, 502);
        assert_eq!(response.error_type, "integration/transport/transport_failed");
        assert_eq!(response.user_message, "Delivery to the collector failed");
        // Internal details never leak into the user message.
        assert!(!response.user_message.contains("collector down"));
    }

    #[test]
    fn handle_never_fails_even_when_a_handler_rejects() {
        let (manager, bus, _) = manager();
        bus.on(EventKind::ErrorOccurred, |_| {
            Err(PipelineError::internal("subscriber broke"))
        });

        let response = manager.handle("boom");
        assert!(response.error_reference.starts_with("SYSTEM_ERROR_HANDLING_FAILED_"));
        assert_eq!(response.status_code, 500);
    }

    #[test]
    fn plain_messages_normalize_to_system_unknown() {
        let (manager, _, _) = manager();
        let response = manager.handle("something odd happened");
        assert_eq!(response.error_type, "system/general/unknown_error");
        assert_eq!(response.status_code, 500);
    }

    #[test]
    fn recovery_resets_referenced_circuit() {
        let (manager, _, breaker) = manager();
        for _ in 0..3 {
            breaker.record_error("collector-edge").unwrap();
        }
        assert!(breaker.is_open("collector-edge"));

        let error = manager.create_error(
            ErrorCategory::Integration,
            "circuit_open",
            None,
            Some(HashMap::from([(
                "circuit".to_string(),
                json!("collector-edge"),
            )])),
            None,
        );

        assert!(manager.attempt_recovery(&error));
        assert!(!breaker.is_open("collector-edge"));
    }

    #[test]
    fn recovery_is_false_for_untagged_errors() {
        let (manager, _, _) = manager();
        let error = manager.create_error(ErrorCategory::Business, "not_found", None, None, None);
        assert!(!manager.attempt_recovery(&error));
    }

    #[test]
    fn user_message_varies_with_level() {
        let (manager, _, _) = manager();
        let e = manager.user_message(ErrorCategory::Integration, "circuit_open", LogLevel::Error);
        let w = manager.user_message(ErrorCategory::Integration, "circuit_open", LogLevel::Warn);
        assert_ne!(e, w);

        // Unregistered codes get the category's generic message.
        let generic = manager.user_message(ErrorCategory::Security, "nope", LogLevel::Error);
        assert_eq!(generic, "The request could not be authorized.");
    }
}
