//! # Log Aggregator
//!
//! Merges the log stream into keyed, size-bounded batches. Batches are
//! keyed by `category_level_date` (UTC) and hold storage-optimized
//! projections of their entries; a batch whose serialized size reaches
//! the configured bound is rotated atomically before the next append,
//! so a single `aggregate` call never leaves an over-bound live batch.
//!
//! All map mutation happens under one mutex covering the full
//! read-rotate-append sequence, preserving the source's single-threaded
//! atomicity on a multi-threaded runtime.

use std::collections::HashMap;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use crate::bus::{BusEvent, EventBus};
use crate::core::config::LogsConfig;
use crate::core::error::PipelineResult;
use crate::core::types::{LogEntry, StoredLogEntry};

/// One live batch of optimized entries under a single key
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogBatch {
    pub key: String,
    pub entries: Vec<StoredLogEntry>,
    /// Accumulated serialized byte size of `entries`
    pub size_bytes: usize,
    pub count: usize,
    pub last_updated: DateTime<Utc>,
}

impl LogBatch {
    fn new(key: String) -> Self {
        Self {
            key,
            entries: Vec::new(),
            size_bytes: 0,
            count: 0,
            last_updated: Utc::now(),
        }
    }
}

/// Size-rotated, age-evicted log batch store
pub struct LogAggregator {
    config: LogsConfig,
    bus: Arc<EventBus>,
    batches: Mutex<HashMap<String, LogBatch>>,
}

impl LogAggregator {
    pub fn new(config: LogsConfig, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            bus,
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// Batch key: `category_level_YYYY-MM-DD` in UTC
    pub fn batch_key(entry: &LogEntry) -> String {
        format!(
            "{}_{}_{}",
            entry.category.as_str(),
            entry.level.as_str(),
            entry.timestamp.format("%Y-%m-%d")
        )
    }

    /// Merge one entry into its batch, rotating first if the batch is
    /// already at the serialized-size bound.
    ///
    /// Failures (size accounting) are returned to the caller after
    /// being surfaced on the bus by the facade; aggregation errors are
    /// never silently swallowed here.
    pub fn aggregate(&self, entry: &LogEntry) -> PipelineResult<()> {
        let key = Self::batch_key(entry);
        let optimized = StoredLogEntry::from(entry);
        let entry_size = serde_json::to_vec(&optimized)?.len();

        let rotated = {
            let mut batches = self.batches.lock();
            let batch = batches
                .entry(key.clone())
                .or_insert_with(|| LogBatch::new(key.clone()));

            // Rotate when this append would push the batch at or over
            // the bound; an empty batch always accepts its first entry.
            let rotated = if batch.size_bytes + entry_size >= self.config.max_batch_size_bytes
                && batch.count > 0
            {
                Some(std::mem::replace(batch, LogBatch::new(key.clone())))
            } else {
                None
            };

            batch.entries.push(optimized);
            batch.size_bytes += entry_size;
            batch.count += 1;
            batch.last_updated = Utc::now();
            trace!(key = %key, count = batch.count, "log entry aggregated");
            rotated
        };

        if let Some(old) = rotated {
            debug!(key = %key, entries = old.count, bytes = old.size_bytes, "log batch rotated");
            self.bus.emit(&BusEvent::LogBatchFull {
                key: key.clone(),
                size_bytes: old.size_bytes,
            })?;
            self.bus.emit(&BusEvent::LogBatchRotated {
                key,
                entry_count: old.count,
                size_bytes: old.size_bytes,
            })?;
        }
        Ok(())
    }

    /// Snapshot of one batch
    pub fn get_batch(&self, key: &str) -> Option<LogBatch> {
        self.batches.lock().get(key).cloned()
    }

    /// Snapshot of every live batch
    pub fn get_all_batches(&self) -> Vec<LogBatch> {
        self.batches.lock().values().cloned().collect()
    }

    /// Drop batches idle for longer than `max_batch_age`; returns the
    /// number removed. Runs on a fixed interval and on `system.cleanup`.
    pub fn cleanup(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.max_batch_age)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut batches = self.batches.lock();
        let before = batches.len();
        batches.retain(|_, batch| batch.last_updated >= cutoff);
        let removed = before - batches.len();
        if removed > 0 {
            debug!(removed, "stale log batches evicted");
        }
        removed
    }

    /// Drop all batches without flushing; shutdown path only
    pub fn clear(&self) {
        self.batches.lock().clear();
    }
}
