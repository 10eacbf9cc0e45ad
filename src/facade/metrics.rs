//! # Metrics Facade
//!
//! Front door for recording observations. Every call gets a unique
//! correlation reference up front; the injected sampler then decides
//! whether the observation continues into aggregation and persistence
//! or is counted as a sampled drop. Either way the caller receives the
//! reference, so traces can correlate against observations that were
//! never shipped.

use std::collections::HashMap;
use std::sync::Arc;
use chrono::Utc;
use serde_json::Value;

use crate::aggregation::MetricAggregator;
use crate::bus::{BusEvent, DropReason, EventBus};
use crate::core::error::PipelineResult;
use crate::core::error_manager::ErrorManager;
use crate::core::types::{generate_reference, MetricEntry, MetricType, MetricUnit};
use crate::facade::sampler::MetricSampler;
use crate::persistence::{PersistDisposition, Persister};

/// What happened to one recorded observation
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub reference: String,
    pub value: f64,
    pub metric_type: MetricType,
    pub unit: MetricUnit,
    pub metadata: HashMap<String, Value>,
    /// `false` means the sampler dropped the observation before
    /// aggregation; the reference is still valid for correlation
    pub sampled: bool,
    pub disposition: Option<PersistDisposition>,
}

/// Sampling, aggregating, persisting entry point for metrics
pub struct MetricsManager {
    bus: Arc<EventBus>,
    sampler: Arc<dyn MetricSampler>,
    aggregator: Arc<MetricAggregator>,
    persister: Arc<Persister<MetricEntry>>,
    errors: Arc<ErrorManager>,
}

impl MetricsManager {
    pub fn new(
        bus: Arc<EventBus>,
        sampler: Arc<dyn MetricSampler>,
        aggregator: Arc<MetricAggregator>,
        persister: Arc<Persister<MetricEntry>>,
        errors: Arc<ErrorManager>,
    ) -> Self {
        Self { bus, sampler, aggregator, persister, errors }
    }

    /// Record one observation
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        category: &str,
        component: &str,
        action: &str,
        value: f64,
        metric_type: MetricType,
        unit: MetricUnit,
        metadata: HashMap<String, Value>,
    ) -> PipelineResult<MetricRecord> {
        let reference = generate_reference(&format!("{category}_{component}_{action}"));
        let entry = MetricEntry {
            category: category.to_string(),
            component: component.to_string(),
            action: action.to_string(),
            value,
            metric_type,
            unit,
            reference: reference.clone(),
            timestamp: Utc::now(),
            metadata,
            aggregated_count: None,
        };

        if !self.sampler.should_process(&entry) {
            self.bus.emit(&BusEvent::MetricDropped { reason: DropReason::Sampled, count: 1 })?;
            return Ok(MetricRecord {
                reference,
                value,
                metric_type,
                unit,
                metadata: entry.metadata,
                sampled: false,
                disposition: Some(PersistDisposition::Dropped(DropReason::Sampled)),
            });
        }

        if let Err(error) = self.aggregator.aggregate(&entry) {
            self.errors.handle(error.clone());
            return Err(error);
        }

        let metadata = entry.metadata.clone();
        let disposition = self.persister.persist(entry).await?;
        Ok(MetricRecord {
            reference,
            value,
            metric_type,
            unit,
            metadata,
            sampled: true,
            disposition: Some(disposition),
        })
    }

    /// Counter increment of 1
    pub async fn increment(
        &self,
        category: &str,
        component: &str,
        action: &str,
    ) -> PipelineResult<MetricRecord> {
        self.record(
            category,
            component,
            action,
            1.0,
            MetricType::Counter,
            MetricUnit::Count,
            HashMap::new(),
        )
        .await
    }

    /// Point-in-time gauge reading
    pub async fn gauge(
        &self,
        category: &str,
        component: &str,
        action: &str,
        value: f64,
        unit: MetricUnit,
    ) -> PipelineResult<MetricRecord> {
        self.record(category, component, action, value, MetricType::Gauge, unit, HashMap::new())
            .await
    }

    /// Duration observation in milliseconds
    pub async fn timing(
        &self,
        category: &str,
        component: &str,
        action: &str,
        elapsed: std::time::Duration,
    ) -> PipelineResult<MetricRecord> {
        self.record(
            category,
            component,
            action,
            elapsed.as_secs_f64() * 1000.0,
            MetricType::Histogram,
            MetricUnit::Milliseconds,
            HashMap::new(),
        )
        .await
    }
}
