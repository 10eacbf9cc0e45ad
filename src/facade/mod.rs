//! Caller-facing surface: logging and metrics managers plus the
//! pluggable sampling seam.

pub mod logger;
pub mod metrics;
pub mod sampler;

pub use logger::{LogOptions, LoggerManager};
pub use metrics::{MetricRecord, MetricsManager};
pub use sampler::{AlwaysSampler, MetricSampler, ThresholdSampler};
