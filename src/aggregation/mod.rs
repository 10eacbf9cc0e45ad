//! Windowed aggregation: keyed size-rotated log batches and
//! two-generation tumbling metric windows.

pub mod logs;
pub mod metrics;

pub use logs::{LogAggregator, LogBatch};
pub use metrics::{AggregatedMetric, MetricAggregator};
