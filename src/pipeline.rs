//! # Pipeline Assembly
//!
//! Wires the full pipeline from one [`PipelineConfig`]: event bus,
//! circuit breaker, error manager, aggregators, persisters and the two
//! facades, all sharing explicitly injected `Arc` handles. `start`
//! launches the background loops (scheduled flushes, window rotation,
//! cleanup) under one cancellation token; `shutdown` cancels them,
//! attempts a final flush and discards remaining in-memory state.

use std::sync::Arc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregation::{LogAggregator, MetricAggregator};
use crate::bus::{BusEvent, EventBus, EventKind, StreamKind};
use crate::core::circuit_breaker::CircuitBreaker;
use crate::core::config::PipelineConfig;
use crate::core::error::PipelineResult;
use crate::core::error_manager::ErrorManager;
use crate::core::types::{LogEntry, MetricEntry};
use crate::facade::{LoggerManager, MetricSampler, MetricsManager, ThresholdSampler};
use crate::persistence::{compact_metric_batch, ChunkTransport, HttpTransport, Persister};

/// Fully wired pipeline instance
///
/// Owns the background task handles; dropping it without `shutdown`
/// aborts nothing, so call `shutdown` on the way out.
pub struct TelemetryPipeline {
    config: PipelineConfig,
    bus: Arc<EventBus>,
    breaker: Arc<CircuitBreaker>,
    errors: Arc<ErrorManager>,
    log_aggregator: Arc<LogAggregator>,
    metric_aggregator: Arc<MetricAggregator>,
    log_persister: Arc<Persister<LogEntry>>,
    metric_persister: Arc<Persister<MetricEntry>>,
    logger: Arc<LoggerManager>,
    metrics: Arc<MetricsManager>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TelemetryPipeline {
    /// Assemble a pipeline around injected transports and sampler
    pub fn new(
        config: PipelineConfig,
        log_transport: Arc<dyn ChunkTransport<LogEntry>>,
        metric_transport: Arc<dyn ChunkTransport<MetricEntry>>,
        sampler: Arc<dyn MetricSampler>,
    ) -> PipelineResult<Self> {
        config.validate()?;

        let bus = Arc::new(EventBus::new(config.mode));
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker.clone(),
            Arc::clone(&bus),
        ));
        let errors = Arc::new(ErrorManager::new(Arc::clone(&bus), Arc::clone(&breaker)));

        let log_aggregator = Arc::new(LogAggregator::new(config.logs.clone(), Arc::clone(&bus)));
        let metric_aggregator =
            Arc::new(MetricAggregator::new(config.metrics.clone(), Arc::clone(&bus)));

        let log_persister = Persister::new(
            StreamKind::Logs,
            config.logs.persister.clone(),
            config.retry.clone(),
            Arc::clone(&bus),
            Arc::clone(&breaker),
            log_transport,
            None,
        );
        let metric_persister = Persister::new(
            StreamKind::Metrics,
            config.metrics.persister.clone(),
            config.retry.clone(),
            Arc::clone(&bus),
            Arc::clone(&breaker),
            metric_transport,
            Some(Box::new(compact_metric_batch)),
        );

        let logger = Arc::new(LoggerManager::new(
            config.logs.clone(),
            Arc::clone(&log_aggregator),
            Arc::clone(&log_persister),
            Arc::clone(&errors),
        ));
        let metrics = Arc::new(MetricsManager::new(
            Arc::clone(&bus),
            sampler,
            Arc::clone(&metric_aggregator),
            Arc::clone(&metric_persister),
            Arc::clone(&errors),
        ));

        let pipeline = Self {
            config,
            bus,
            breaker,
            errors,
            log_aggregator,
            metric_aggregator,
            log_persister,
            metric_persister,
            logger,
            metrics,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        };
        pipeline.register_default_subscribers();
        Ok(pipeline)
    }

    /// Assemble with the JSON-over-HTTP collector transport and the
    /// configured probabilistic sampler
    pub fn with_http_collector(config: PipelineConfig) -> PipelineResult<Self> {
        let transport = Arc::new(HttpTransport::new(&config.collector)?);
        let sampler = Arc::new(ThresholdSampler::new(config.metrics.sample_rates.clone()));
        Self::new(config, Arc::clone(&transport) as _, transport, sampler)
    }

    /// Launch the background loops; idempotent only in the sense that
    /// calling it twice doubles the loops, so call it once.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();

        tasks.push(self.log_persister.start(self.cancel.child_token()));
        tasks.push(self.metric_persister.start(self.cancel.child_token()));

        // Tumbling window rotation at window boundaries.
        {
            let aggregator = Arc::clone(&self.metric_aggregator);
            let cancel = self.cancel.child_token();
            let period = self.config.metrics.window_size;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    if let Err(e) = aggregator.rotate_window() {
                        crate::diag::report_task_failure("window-rotation", &e.to_string());
                    }
                }
            }));
        }

        // Periodic eviction of stale batches and expired windows.
        {
            let logs = Arc::clone(&self.log_aggregator);
            let cancel = self.cancel.child_token();
            let period = self.config.logs.cleanup_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    logs.cleanup();
                }
            }));
        }
        {
            let metrics = Arc::clone(&self.metric_aggregator);
            let cancel = self.cancel.child_token();
            let period = self.config.metrics.cleanup_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    metrics.cleanup();
                }
            }));
        }

        info!(mode = ?self.config.mode, "telemetry pipeline started");
    }

    /// Stop the background loops, attempt one final flush of both
    /// streams, then discard remaining in-memory state.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        self.log_persister.shutdown().await;
        self.metric_persister.shutdown().await;
        self.log_aggregator.clear();
        self.metric_aggregator.clear();
        info!("telemetry pipeline stopped");
    }

    /// Surface pipeline events in the process's own diagnostics and
    /// wire `system.cleanup` to an immediate eviction pass.
    fn register_default_subscribers(&self) {
        self.bus.on(EventKind::ErrorOccurred, |event| {
            if let BusEvent::ErrorOccurred { error_type, message, reference, .. } = event {
                error!(error_type, reference, "{message}");
            }
            Ok(())
        });
        self.bus.on(EventKind::CircuitOpened, |event| {
            if let BusEvent::CircuitOpened { circuit, reason, error_count } = event {
                warn!(circuit, reason, error_count, "circuit opened");
                metrics::counter!("telemetry_circuit_opened_total", "circuit" => circuit.clone())
                    .increment(1);
            }
            Ok(())
        });

        let logs = Arc::clone(&self.log_aggregator);
        let metrics = Arc::clone(&self.metric_aggregator);
        self.bus.on(EventKind::SystemCleanup, move |_| {
            logs.cleanup();
            metrics.cleanup();
            Ok(())
        });
    }

    pub fn logger(&self) -> &Arc<LoggerManager> {
        &self.logger
    }

    pub fn metrics(&self) -> &Arc<MetricsManager> {
        &self.metrics
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn error_manager(&self) -> &Arc<ErrorManager> {
        &self.errors
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}
