//! # Telemetry Entry Types
//!
//! Core data model for the pipeline: log entries, metric entries, the
//! enumerations they carry, and the shaping helpers applied before an
//! entry reaches the aggregation and persistence layers.
//!
//! Entries are immutable once created; "sanitizing" produces a new entry
//! rather than mutating in place.

use std::collections::HashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity level of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Canonical lowercase name, used in batch keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Functional category of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    #[default]
    Application,
    Security,
    Performance,
    Audit,
    Integration,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Audit => "audit",
            Self::Integration => "integration",
        }
    }
}

/// Kind of a metric observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

/// Unit a metric value is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricUnit {
    Count,
    Milliseconds,
    Bytes,
    Percent,
}

impl MetricUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Milliseconds => "milliseconds",
            Self::Bytes => "bytes",
            Self::Percent => "percent",
        }
    }
}

/// A single application log entry
///
/// Created by the facade, consumed by the log aggregator and persister.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub level: LogLevel,
    pub category: LogCategory,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl LogEntry {
    /// Return a sanitized copy: message truncated to `max_message_len`
    /// and metadata capped at `max_metadata_entries` keys.
    ///
    /// Metadata keys are retained in sorted order so truncation is
    /// deterministic.
    pub fn sanitized(&self, max_message_len: usize, max_metadata_entries: usize) -> LogEntry {
        let mut entry = self.clone();

        if entry.message.chars().count() > max_message_len {
            let truncated: String = entry.message.chars().take(max_message_len).collect();
            entry.message = format!("{truncated}...[truncated]");
        }

        if entry.metadata.len() > max_metadata_entries {
            let mut keys: Vec<&String> = entry.metadata.keys().collect();
            keys.sort();
            let keep: Vec<String> = keys
                .into_iter()
                .take(max_metadata_entries)
                .cloned()
                .collect();
            entry.metadata.retain(|k, _| keep.contains(k));
        }

        entry
    }
}

/// Storage-optimized projection of a [`LogEntry`]
///
/// Only the fields the collector needs for batch views; metadata is
/// dropped at the aggregation layer to bound memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredLogEntry {
    pub level: LogLevel,
    pub category: LogCategory,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    pub message: String,
}

impl From<&LogEntry> for StoredLogEntry {
    fn from(entry: &LogEntry) -> Self {
        Self {
            level: entry.level,
            category: entry.category,
            timestamp: entry.timestamp,
            user_id: entry.user_id.clone(),
            message: entry.message.clone(),
        }
    }
}

/// A single numeric metric observation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricEntry {
    pub category: String,
    pub component: String,
    pub action: String,
    pub value: f64,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub unit: MetricUnit,
    /// Unique correlation reference, generated at record time and never reused
    pub reference: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Number of raw observations merged into this entry by pre-send
    /// compaction; absent means a single observation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregated_count: Option<u32>,
}

impl MetricEntry {
    /// Grouping key used by both the window aggregator and pre-send
    /// compaction (without the window component).
    pub fn series_key(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            self.category,
            self.component,
            self.action,
            self.metric_type.as_str(),
            self.unit.as_str()
        )
    }
}

/// Encode a number in base36 (lowercase), used for compact timestamp
/// suffixes in correlation references.
pub fn to_base36(mut value: u128) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Generate a correlation reference of the shape
/// `PREFIX_<base36-timestamp>_<base36-random>`.
///
/// The random suffix keeps references unique when several are generated
/// within the same millisecond.
pub fn generate_reference(prefix: &str) -> String {
    let ts = Utc::now().timestamp_millis().max(0) as u128;
    format!(
        "{}_{}_{}",
        prefix.to_uppercase(),
        to_base36(ts),
        to_base36(fastrand::u32(..) as u128)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with(message: &str, metadata_keys: usize) -> LogEntry {
        let mut metadata = HashMap::new();
        for i in 0..metadata_keys {
            metadata.insert(format!("key{i:02}"), serde_json::json!(i));
        }
        LogEntry {
            level: LogLevel::Info,
            category: LogCategory::Application,
            message: message.to_string(),
            timestamp: Utc::now(),
            user_id: Some("user-1".to_string()),
            metadata,
        }
    }

    #[test]
    fn sanitize_truncates_long_messages() {
        let entry = entry_with(&"x".repeat(500), 0);
        let sanitized = entry.sanitized(100, 10);

        assert!(sanitized.message.starts_with(&"x".repeat(100)));
        assert!(sanitized.message.ends_with("...[truncated]"));
        // Original untouched
        assert_eq!(entry.message.len(), 500);
    }

    #[test]
    fn sanitize_caps_metadata_entries() {
        let entry = entry_with("short", 20);
        let sanitized = entry.sanitized(100, 5);

        assert_eq!(sanitized.metadata.len(), 5);
        // Deterministic: lowest sorted keys survive
        assert!(sanitized.metadata.contains_key("key00"));
        assert!(!sanitized.metadata.contains_key("key19"));
    }

    #[test]
    fn sanitize_is_a_noop_within_limits() {
        let entry = entry_with("short", 2);
        let sanitized = entry.sanitized(100, 10);
        assert_eq!(sanitized.message, "short");
        assert_eq!(sanitized.metadata.len(), 2);
    }

    #[test]
    fn stored_projection_drops_metadata() {
        let entry = entry_with("hello", 3);
        let stored = StoredLogEntry::from(&entry);
        let json = serde_json::to_value(&stored).unwrap();
        assert!(json.get("metadata").is_none());
        assert_eq!(json["message"], "hello");
        assert_eq!(json["userId"], "user-1");
    }

    #[test]
    fn base36_round_values() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(36 * 36 + 1), "101");
    }

    #[test]
    fn references_are_unique_and_prefixed() {
        let a = generate_reference("system_persister_enqueue");
        let b = generate_reference("system_persister_enqueue");
        assert!(a.starts_with("SYSTEM_PERSISTER_ENQUEUE_"));
        assert_ne!(a, b);
    }
}
