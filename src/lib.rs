//! # Telemetry Pipeline - Core Library Crate
//!
//! In-process observability pipeline: buffers application logs and
//! metrics, aggregates them into keyed batches and tumbling windows,
//! and ships them to a remote collector with chunking, retry/backoff
//! and circuit breaking. Designed to degrade by dropping telemetry,
//! never by failing the host application.
//!
//! ## Quick Start
//!
//! ```no_run
//! use telemetry_pipeline::{PipelineConfig, TelemetryPipeline};
//! use telemetry_pipeline::facade::LogOptions;
//!
//! # async fn run() -> telemetry_pipeline::PipelineResult<()> {
//! let pipeline = TelemetryPipeline::with_http_collector(PipelineConfig::from_env()?)?;
//! pipeline.start();
//!
//! pipeline.logger().info("service started", LogOptions::default()).await?;
//! pipeline.metrics().increment("checkout", "cart", "add").await?;
//!
//! pipeline.shutdown().await;
//! # Ok(())
//! # }
//! ```

/// Fundamental building blocks: entry types, configuration, the error
/// taxonomy and the circuit breaker
pub mod core;

/// Typed publish/subscribe bus connecting pipeline components
pub mod bus;

/// Windowed aggregation of log batches and metric windows
pub mod aggregation;

/// Bounded queues, chunked transport and retry/backoff delivery
pub mod persistence;

/// Caller-facing logging and metrics managers plus the sampling seam
pub mod facade;

/// The pipeline's own diagnostics (tracing subscriber setup)
pub mod diag;

/// Assembly of a full pipeline from one configuration
pub mod pipeline;

/// Main error and result types used throughout the pipeline
pub use crate::core::error::{PipelineError, PipelineResult};

/// Top-level configuration, buildable from defaults or environment
pub use crate::core::config::PipelineConfig;

/// Primary entry point for using this library
pub use crate::pipeline::TelemetryPipeline;

pub use crate::bus::{BusEvent, EventBus, EventKind, RuntimeMode};
pub use crate::core::error_manager::{ErrorCategory, ErrorManager, ErrorResponse};
pub use crate::core::types::{LogCategory, LogEntry, LogLevel, MetricEntry, MetricType, MetricUnit};
pub use crate::facade::{LoggerManager, MetricsManager};
