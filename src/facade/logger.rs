//! # Logging Facade
//!
//! The single entry point callers use to record a log line. The facade
//! filters below the configured level, sanitizes the entry, merges it
//! into the windowed aggregator and hands it to the persister. Failures
//! are routed through the error manager before propagating, so every
//! aggregation failure is visible on the bus even when the caller
//! discards the `Err`.

use std::collections::HashMap;
use std::sync::Arc;
use chrono::Utc;
use serde_json::Value;
use tracing::trace;

use crate::aggregation::LogAggregator;
use crate::core::config::LogsConfig;
use crate::core::error::PipelineResult;
use crate::core::error_manager::ErrorManager;
use crate::core::types::{LogCategory, LogEntry, LogLevel};
use crate::persistence::{PersistDisposition, Persister};

/// Per-call log settings beyond level and message
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub category: LogCategory,
    pub user_id: Option<String>,
    pub metadata: HashMap<String, Value>,
}

impl LogOptions {
    pub fn category(category: LogCategory) -> Self {
        Self { category, ..Self::default() }
    }
}

/// Level-filtering, sanitizing front door for the log stream
pub struct LoggerManager {
    config: LogsConfig,
    aggregator: Arc<LogAggregator>,
    persister: Arc<Persister<LogEntry>>,
    errors: Arc<ErrorManager>,
}

impl LoggerManager {
    pub fn new(
        config: LogsConfig,
        aggregator: Arc<LogAggregator>,
        persister: Arc<Persister<LogEntry>>,
        errors: Arc<ErrorManager>,
    ) -> Self {
        Self { config, aggregator, persister, errors }
    }

    /// Record one log line
    ///
    /// Returns `None` when the entry was filtered below the minimum
    /// level, otherwise the persister's disposition for the sanitized
    /// entry.
    pub async fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        options: LogOptions,
    ) -> PipelineResult<Option<PersistDisposition>> {
        if level < self.config.min_level {
            trace!(level = level.as_str(), "log entry below minimum level");
            return Ok(None);
        }

        let entry = LogEntry {
            level,
            category: options.category,
            message: message.into(),
            timestamp: Utc::now(),
            user_id: options.user_id,
            metadata: options.metadata,
        }
        .sanitized(self.config.max_message_length, self.config.max_metadata_entries);

        if let Err(error) = self.aggregator.aggregate(&entry) {
            self.errors.handle(error.clone());
            return Err(error);
        }

        let disposition = self.persister.persist(entry).await?;
        Ok(Some(disposition))
    }

    pub async fn debug(
        &self,
        message: impl Into<String>,
        options: LogOptions,
    ) -> PipelineResult<Option<PersistDisposition>> {
        self.log(LogLevel::Debug, message, options).await
    }

    pub async fn info(
        &self,
        message: impl Into<String>,
        options: LogOptions,
    ) -> PipelineResult<Option<PersistDisposition>> {
        self.log(LogLevel::Info, message, options).await
    }

    pub async fn warn(
        &self,
        message: impl Into<String>,
        options: LogOptions,
    ) -> PipelineResult<Option<PersistDisposition>> {
        self.log(LogLevel::Warn, message, options).await
    }

    pub async fn error(
        &self,
        message: impl Into<String>,
        options: LogOptions,
    ) -> PipelineResult<Option<PersistDisposition>> {
        self.log(LogLevel::Error, message, options).await
    }
}
