//! # Pipeline Configuration
//!
//! Every tunable constant in the pipeline, grouped per component, with
//! production defaults, environment-variable overrides (`TP_*`) and
//! validation. There is no dynamic runtime reconfiguration: a config is
//! read once at composition time and handed to the components by value.

use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::bus::RuntimeMode;
use crate::core::circuit_breaker::CircuitBreakerConfig;
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::types::LogLevel;

/// Remote collector endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Base URL of the collector, e.g. `https://collector.internal:8443`
    pub base_url: String,

    /// Per-request timeout for transport calls
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4810".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Retry/backoff budget for a single chunk send
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per chunk before the failure is permanent
    pub max_attempts: u32,

    /// Delay before the first retry; doubles per attempt
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Ceiling on the exponential backoff
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Queueing and flush cadence shared by both persister instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersisterConfig {
    /// Hard bound on queued entries; enqueue past this drops the entry
    pub max_queue_size: usize,

    /// Queue length that triggers an immediate flush
    pub batch_threshold: usize,

    /// Entries per transport chunk
    pub chunk_size: usize,

    /// Baseline interval of the scheduled flush loop
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Ceiling the scheduled interval backs off to after failures
    #[serde(with = "humantime_serde")]
    pub max_flush_interval: Duration,

    /// Minimum queue length for a scheduled flush to bother
    pub min_flush_size: usize,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 500,
            batch_threshold: 100,
            chunk_size: 25,
            flush_interval: Duration::from_secs(30),
            max_flush_interval: Duration::from_secs(300),
            min_flush_size: 10,
        }
    }
}

/// Log-side aggregation and shaping settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsConfig {
    /// Serialized-size bound of one live batch; reaching it rotates
    pub max_batch_size_bytes: usize,

    /// Batches idle longer than this are dropped by cleanup
    #[serde(with = "humantime_serde")]
    pub max_batch_age: Duration,

    /// Cadence of the background cleanup pass
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Entries below this level are filtered at the facade
    pub min_level: LogLevel,

    /// Messages longer than this are truncated during sanitization
    pub max_message_length: usize,

    /// Metadata maps are capped at this many keys during sanitization
    pub max_metadata_entries: usize,

    pub persister: PersisterConfig,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            max_batch_size_bytes: 64 * 1024,
            max_batch_age: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
            min_level: LogLevel::Debug,
            max_message_length: 1000,
            max_metadata_entries: 10,
            persister: PersisterConfig::default(),
        }
    }
}

/// Default sampling rates per metric type, overridable per deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRates {
    pub counter: f64,
    pub gauge: f64,
    pub histogram: f64,
}

impl Default for SampleRates {
    fn default() -> Self {
        Self { counter: 1.0, gauge: 1.0, histogram: 0.5 }
    }
}

/// Metric-side windowing and sampling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Tumbling window width
    #[serde(with = "humantime_serde")]
    pub window_size: Duration,

    /// Ring of retained windows; older windows are purged
    pub max_windows: u32,

    /// Distinct keys allowed in the current window before a forced
    /// rotation bounds key-cardinality explosions
    pub max_metrics_per_window: usize,

    /// Cadence of the background purge pass
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,

    pub sample_rates: SampleRates,

    pub persister: PersisterConfig,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_size: Duration::from_secs(60),
            max_windows: 5,
            max_metrics_per_window: 1000,
            cleanup_interval: Duration::from_secs(10 * 60),
            sample_rates: SampleRates::default(),
            persister: PersisterConfig::default(),
        }
    }
}

/// Top-level pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub mode: RuntimeMode,
    pub collector: CollectorConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub logs: LogsConfig,
    pub metrics: MetricsConfig,
}

impl PipelineConfig {
    /// Build a config from defaults plus `TP_*` environment overrides
    pub fn from_env() -> PipelineResult<Self> {
        let mut config = Self::default();

        if let Ok(mode) = std::env::var("TP_MODE") {
            config.mode = match mode.as_str() {
                "production" => RuntimeMode::Production,
                "development" => RuntimeMode::Development,
                other => {
                    return Err(PipelineError::config(format!(
                        "TP_MODE must be 'production' or 'development', got '{other}'"
                    )))
                }
            };
        }
        if let Ok(url) = std::env::var("TP_COLLECTOR_URL") {
            config.collector.base_url = url;
        }

        override_usize("TP_LOG_MAX_BATCH_SIZE_BYTES", &mut config.logs.max_batch_size_bytes)?;
        override_usize("TP_LOG_MAX_QUEUE_SIZE", &mut config.logs.persister.max_queue_size)?;
        override_usize("TP_LOG_BATCH_THRESHOLD", &mut config.logs.persister.batch_threshold)?;
        override_usize("TP_LOG_CHUNK_SIZE", &mut config.logs.persister.chunk_size)?;
        override_duration_secs("TP_LOG_FLUSH_INTERVAL_SECS", &mut config.logs.persister.flush_interval)?;

        override_duration_secs("TP_METRIC_WINDOW_SIZE_SECS", &mut config.metrics.window_size)?;
        override_u32("TP_METRIC_MAX_WINDOWS", &mut config.metrics.max_windows)?;
        override_usize("TP_METRIC_MAX_PER_WINDOW", &mut config.metrics.max_metrics_per_window)?;
        override_usize("TP_METRIC_MAX_QUEUE_SIZE", &mut config.metrics.persister.max_queue_size)?;
        override_usize("TP_METRIC_BATCH_THRESHOLD", &mut config.metrics.persister.batch_threshold)?;

        override_u32("TP_RETRY_MAX_ATTEMPTS", &mut config.retry.max_attempts)?;
        override_duration_millis("TP_RETRY_BASE_DELAY_MS", &mut config.retry.base_delay)?;
        override_duration_secs("TP_RETRY_MAX_BACKOFF_SECS", &mut config.retry.max_backoff)?;

        override_u32("TP_CIRCUIT_MAX_ERRORS", &mut config.circuit_breaker.max_errors)?;
        override_duration_secs("TP_CIRCUIT_RESET_TIMEOUT_SECS", &mut config.circuit_breaker.reset_timeout)?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configs that would make the pipeline misbehave silently
    pub fn validate(&self) -> PipelineResult<()> {
        if self.collector.base_url.is_empty() {
            return Err(PipelineError::config("collector.base_url must not be empty"));
        }
        if !self.collector.base_url.starts_with("http://")
            && !self.collector.base_url.starts_with("https://")
        {
            return Err(PipelineError::config("collector.base_url must be an http(s) URL"));
        }
        if self.circuit_breaker.max_errors == 0 {
            return Err(PipelineError::config("circuit_breaker.max_errors must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::config("retry.max_attempts must be at least 1"));
        }
        if self.metrics.window_size.is_zero() {
            return Err(PipelineError::config("metrics.window_size must be non-zero"));
        }
        if self.metrics.max_windows == 0 {
            return Err(PipelineError::config("metrics.max_windows must be at least 1"));
        }
        for (name, persister) in [
            ("logs", &self.logs.persister),
            ("metrics", &self.metrics.persister),
        ] {
            if persister.chunk_size == 0 {
                return Err(PipelineError::config(format!(
                    "{name}.persister.chunk_size must be at least 1"
                )));
            }
            if persister.batch_threshold > persister.max_queue_size {
                return Err(PipelineError::config(format!(
                    "{name}.persister.batch_threshold must not exceed max_queue_size"
                )));
            }
        }
        for (name, rate) in [
            ("counter", self.metrics.sample_rates.counter),
            ("gauge", self.metrics.sample_rates.gauge),
            ("histogram", self.metrics.sample_rates.histogram),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(PipelineError::config(format!(
                    "metrics.sample_rates.{name} must be within [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

fn override_usize(var: &str, target: &mut usize) -> PipelineResult<()> {
    if let Ok(raw) = std::env::var(var) {
        *target = raw
            .parse()
            .map_err(|_| PipelineError::config(format!("{var} must be an unsigned integer")))?;
    }
    Ok(())
}

fn override_u32(var: &str, target: &mut u32) -> PipelineResult<()> {
    if let Ok(raw) = std::env::var(var) {
        *target = raw
            .parse()
            .map_err(|_| PipelineError::config(format!("{var} must be an unsigned integer")))?;
    }
    Ok(())
}

fn override_duration_secs(var: &str, target: &mut Duration) -> PipelineResult<()> {
    if let Ok(raw) = std::env::var(var) {
        let secs: u64 = raw
            .parse()
            .map_err(|_| PipelineError::config(format!("{var} must be whole seconds")))?;
        *target = Duration::from_secs(secs);
    }
    Ok(())
}

fn override_duration_millis(var: &str, target: &mut Duration) -> PipelineResult<()> {
    if let Ok(raw) = std::env::var(var) {
        let millis: u64 = raw
            .parse()
            .map_err(|_| PipelineError::config(format!("{var} must be whole milliseconds")))?;
        *target = Duration::from_millis(millis);
    }
    Ok(())
}
