//! # Metric Window Aggregator
//!
//! Merges the metric stream into fixed tumbling windows. Two
//! generations are retained, `current` and `previous`; a rotation moves
//! current to previous and starts a fresh map. Rotation has two
//! independent triggers: a background timer every window size, and a
//! distinct-key bound on the current window that protects memory under
//! key-cardinality explosions.
//!
//! Each key maintains a numerically stable running mean
//! (`avg += (value - avg) / count`) rather than recomputing `sum/count`,
//! so very long-running windows do not accumulate float drift.

use std::collections::HashMap;
use std::sync::Arc;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use crate::bus::{BusEvent, EventBus, RotationTrigger};
use crate::core::config::MetricsConfig;
use crate::core::error::PipelineResult;
use crate::core::types::MetricEntry;

/// Aggregated view of one series within one window
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedMetric {
    pub category: String,
    pub component: String,
    pub action: String,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub sum: f64,
    pub count: u64,
    pub time_window_start: DateTime<Utc>,
    pub time_window_end: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AggregatedMetric {
    fn new(metric: &MetricEntry, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            category: metric.category.clone(),
            component: metric.component.clone(),
            action: metric.action.clone(),
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            avg: 0.0,
            sum: 0.0,
            count: 0,
            time_window_start: start,
            time_window_end: end,
            last_updated: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        // Welford running mean; mathematically sum/count, but stable.
        self.avg += (value - self.avg) / self.count as f64;
        self.last_updated = Utc::now();
    }
}

#[derive(Default)]
struct Windows {
    current: HashMap<String, AggregatedMetric>,
    previous: HashMap<String, AggregatedMetric>,
}

/// Two-generation tumbling-window metric store
pub struct MetricAggregator {
    config: MetricsConfig,
    bus: Arc<EventBus>,
    windows: Mutex<Windows>,
}

impl MetricAggregator {
    pub fn new(config: MetricsConfig, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            bus,
            windows: Mutex::new(Windows::default()),
        }
    }

    /// Start of the tumbling window containing `timestamp`
    pub fn window_start(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.config.window_size.as_secs().max(1) as i64;
        let secs = timestamp.timestamp();
        let floored = secs - secs.rem_euclid(width);
        Utc.timestamp_opt(floored, 0)
            .single()
            .unwrap_or(timestamp)
    }

    /// Window key: `category_component_action_windowStart`
    pub fn window_key(&self, metric: &MetricEntry) -> String {
        format!(
            "{}_{}_{}_{}",
            metric.category,
            metric.component,
            metric.action,
            self.window_start(metric.timestamp).timestamp()
        )
    }

    /// Merge one observation into the current window
    ///
    /// If the current window is already at the distinct-key bound and
    /// this observation would add a new key, the window is force-rotated
    /// first (previous generation discarded).
    pub fn aggregate(&self, metric: &MetricEntry) -> PipelineResult<()> {
        let key = self.window_key(metric);
        let start = self.window_start(metric.timestamp);
        let end = start
            + chrono::Duration::from_std(self.config.window_size)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let forced_rotation = {
            let mut windows = self.windows.lock();

            let forced = if windows.current.len() >= self.config.max_metrics_per_window
                && !windows.current.contains_key(&key)
            {
                let rotated = std::mem::take(&mut windows.current);
                let rotated_keys = rotated.len();
                windows.previous = rotated;
                Some(rotated_keys)
            } else {
                None
            };

            let slot = windows
                .current
                .entry(key)
                .or_insert_with(|| AggregatedMetric::new(metric, start, end));
            slot.observe(metric.value);
            trace!(series = metric.series_key().as_str(), count = slot.count, "metric aggregated");
            forced
        };

        if let Some(rotated_keys) = forced_rotation {
            debug!(rotated_keys, "metrics window force-rotated at cardinality bound");
            self.bus.emit(&BusEvent::MetricsWindowRotated {
                trigger: RotationTrigger::Cardinality,
                rotated_keys,
            })?;
        }
        Ok(())
    }

    /// Timer-driven rotation: `previous ← current`, `current ← {}`
    ///
    /// Rotating with an empty current window is a no-op, so an idle
    /// pipeline neither loses the previous generation nor duplicates
    /// anything. Returns the number of keys rotated out.
    pub fn rotate_window(&self) -> PipelineResult<usize> {
        let rotated_keys = {
            let mut windows = self.windows.lock();
            if windows.current.is_empty() {
                return Ok(0);
            }
            let rotated = std::mem::take(&mut windows.current);
            let rotated_keys = rotated.len();
            windows.previous = rotated;
            rotated_keys
        };

        debug!(rotated_keys, "metrics window rotated");
        self.bus.emit(&BusEvent::MetricsWindowRotated {
            trigger: RotationTrigger::Timer,
            rotated_keys,
        })?;
        Ok(rotated_keys)
    }

    /// Query both generations for a series, optionally filtered to
    /// windows overlapping `time_window`.
    ///
    /// Results from both generations are concatenated without merging
    /// or ordering guarantees.
    pub fn get_aggregation(
        &self,
        category: &str,
        component: &str,
        action: &str,
        time_window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Vec<AggregatedMetric> {
        let windows = self.windows.lock();
        windows
            .current
            .values()
            .chain(windows.previous.values())
            .filter(|m| m.category == category && m.component == component && m.action == action)
            .filter(|m| match time_window {
                Some((from, to)) => m.time_window_start < to && m.time_window_end > from,
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Purge fully rotated-out windows older than
    /// `max_windows × window_size`; returns the number removed.
    pub fn cleanup(&self) -> usize {
        let retention = self.config.window_size * self.config.max_windows;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::minutes(5));

        let mut windows = self.windows.lock();
        let before = windows.current.len() + windows.previous.len();
        windows.current.retain(|_, m| m.time_window_end >= cutoff);
        windows.previous.retain(|_, m| m.time_window_end >= cutoff);
        let removed = before - windows.current.len() - windows.previous.len();
        if removed > 0 {
            debug!(removed, "expired metric windows purged");
        }
        removed
    }

    /// Drop all windows without rotating; shutdown path only
    pub fn clear(&self) {
        let mut windows = self.windows.lock();
        windows.current.clear();
        windows.previous.clear();
    }

    #[cfg(test)]
    fn generation_sizes(&self) -> (usize, usize) {
        let windows = self.windows.lock();
        (windows.current.len(), windows.previous.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventKind, RuntimeMode};
    use crate::core::types::{MetricType, MetricUnit};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn metric(action: &str, value: f64) -> MetricEntry {
        MetricEntry {
            category: "checkout".to_string(),
            component: "cart".to_string(),
            action: action.to_string(),
            value,
            metric_type: MetricType::Histogram,
            unit: MetricUnit::Milliseconds,
            reference: format!("ref-{action}-{value}"),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            aggregated_count: None,
        }
    }

    fn aggregator(max_metrics_per_window: usize) -> (MetricAggregator, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(RuntimeMode::Development));
        let config = MetricsConfig {
            max_metrics_per_window,
            ..MetricsConfig::default()
        };
        (MetricAggregator::new(config, Arc::clone(&bus)), bus)
    }

    #[test]
    fn running_average_matches_sum_over_n() {
        let (agg, _) = aggregator(1000);
        let values = [3.5, 12.25, 0.001, 98.75, 42.0, 7.125, 0.33, 55.5];
        for v in values {
            agg.aggregate(&metric("load", v)).unwrap();
        }

        let results = agg.get_aggregation("checkout", "cart", "load", None);
        assert_eq!(results.len(), 1);
        let m = &results[0];

        let expected = values.iter().sum::<f64>() / values.len() as f64;
        assert!((m.avg - expected).abs() / expected < 1e-9);
        assert_eq!(m.count, values.len() as u64);
        assert_eq!(m.min, 0.001);
        assert_eq!(m.max, 98.75);
        assert!((m.sum - values.iter().sum::<f64>()).abs() < 1e-9);
    }

    #[test]
    fn min_max_start_at_infinities() {
        let m = AggregatedMetric::new(
            &metric("load", 1.0),
            Utc::now(),
            Utc::now() + chrono::Duration::seconds(60),
        );
        assert!(m.min.is_infinite() && m.min.is_sign_positive());
        assert!(m.max.is_infinite() && m.max.is_sign_negative());
        assert_eq!(m.count, 0);
    }

    #[test]
    fn window_start_floors_to_the_window_grid() {
        let (agg, _) = aggregator(1000);
        let ts = Utc.timestamp_opt(1_700_000_123, 0).single().unwrap();
        let start = agg.window_start(ts);
        assert_eq!(start.timestamp(), 1_700_000_123 - (1_700_000_123 % 60));
        assert_eq!(start.timestamp() % 60, 0);
    }

    #[test]
    fn rotation_moves_current_to_previous() {
        let (agg, _) = aggregator(1000);
        agg.aggregate(&metric("load", 1.0)).unwrap();
        agg.aggregate(&metric("save", 2.0)).unwrap();
        assert_eq!(agg.generation_sizes(), (2, 0));

        let rotated = agg.rotate_window().unwrap();
        assert_eq!(rotated, 2);
        assert_eq!(agg.generation_sizes(), (0, 2));

        // The rotated-out data still answers queries.
        assert_eq!(agg.get_aggregation("checkout", "cart", "load", None).len(), 1);
    }

    #[test]
    fn empty_rotation_is_a_noop_on_previous() {
        let (agg, bus) = aggregator(1000);
        let rotations = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&rotations);
        bus.on(EventKind::MetricsWindowRotated, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        agg.aggregate(&metric("load", 1.0)).unwrap();
        agg.rotate_window().unwrap();
        assert_eq!(agg.generation_sizes(), (0, 1));

        // A second rotation with nothing in current leaves previous intact.
        assert_eq!(agg.rotate_window().unwrap(), 0);
        assert_eq!(agg.generation_sizes(), (0, 1));
        assert_eq!(rotations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cardinality_bound_forces_rotation_before_insert() {
        let (agg, bus) = aggregator(2);
        let triggers = Arc::new(Mutex::new(Vec::new()));
        let t = Arc::clone(&triggers);
        bus.on(EventKind::MetricsWindowRotated, move |event| {
            if let BusEvent::MetricsWindowRotated { trigger, .. } = event {
                t.lock().push(*trigger);
            }
            Ok(())
        });

        agg.aggregate(&metric("a", 1.0)).unwrap();
        agg.aggregate(&metric("b", 1.0)).unwrap();
        // Existing key: no rotation.
        agg.aggregate(&metric("a", 2.0)).unwrap();
        assert_eq!(agg.generation_sizes(), (2, 0));

        // New third key: forced rotation, discarded previous, fresh current.
        agg.aggregate(&metric("c", 1.0)).unwrap();
        assert_eq!(agg.generation_sizes(), (1, 2));
        assert_eq!(*triggers.lock(), vec![RotationTrigger::Cardinality]);
    }

    #[test]
    fn query_spans_both_generations() {
        let (agg, _) = aggregator(1000);
        agg.aggregate(&metric("load", 1.0)).unwrap();
        agg.rotate_window().unwrap();
        agg.aggregate(&metric("load", 9.0)).unwrap();

        let results = agg.get_aggregation("checkout", "cart", "load", None);
        assert_eq!(results.len(), 2);

        // Window filter far in the past matches nothing.
        let past = (
            Utc.timestamp_opt(0, 0).single().unwrap(),
            Utc.timestamp_opt(60, 0).single().unwrap(),
        );
        assert!(agg
            .get_aggregation("checkout", "cart", "load", Some(past))
            .is_empty());
    }

    #[test]
    fn cleanup_purges_expired_windows() {
        let bus = Arc::new(EventBus::new(RuntimeMode::Development));
        let config = MetricsConfig {
            window_size: Duration::from_secs(60),
            max_windows: 5,
            ..MetricsConfig::default()
        };
        let agg = MetricAggregator::new(config, bus);

        let mut old = metric("load", 1.0);
        old.timestamp = Utc::now() - chrono::Duration::minutes(30);
        agg.aggregate(&old).unwrap();
        agg.aggregate(&metric("save", 2.0)).unwrap();

        // Retention is 5 windows x 60s; the 30-minute-old window goes.
        assert_eq!(agg.cleanup(), 1);
        assert!(agg.get_aggregation("checkout", "cart", "load", None).is_empty());
        assert_eq!(agg.get_aggregation("checkout", "cart", "save", None).len(), 1);
    }
}
