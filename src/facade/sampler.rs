//! Pluggable head sampling for the metric facade.
//!
//! The sampling decision is an injected trait object so tests can make
//! it deterministic and deployments can swap policies without touching
//! the facade.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::config::SampleRates;
use crate::core::types::{MetricEntry, MetricType};

/// Head-sampling decision point, consulted once per recorded metric
pub trait MetricSampler: Send + Sync {
    /// `true` keeps the metric, `false` drops it before aggregation
    fn should_process(&self, entry: &MetricEntry) -> bool;
}

/// Keeps everything; the right default for tests and low-volume services
#[derive(Debug, Default)]
pub struct AlwaysSampler;

impl MetricSampler for AlwaysSampler {
    fn should_process(&self, _entry: &MetricEntry) -> bool {
        true
    }
}

/// Per-type probabilistic sampler
///
/// Each metric type carries its own keep-rate in `[0.0, 1.0]`. Rates of
/// `1.0` and `0.0` short-circuit without consuming randomness, so a
/// seeded sampler stays deterministic across metric types with
/// different rates.
pub struct ThresholdSampler {
    rates: SampleRates,
    rng: Mutex<StdRng>,
}

impl ThresholdSampler {
    pub fn new(rates: SampleRates) -> Self {
        Self {
            rates,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic sampler for reproducible test runs
    pub fn with_seed(rates: SampleRates, seed: u64) -> Self {
        Self {
            rates,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn rate_for(&self, metric_type: MetricType) -> f64 {
        match metric_type {
            MetricType::Counter => self.rates.counter,
            MetricType::Gauge => self.rates.gauge,
            MetricType::Histogram => self.rates.histogram,
        }
    }
}

impl MetricSampler for ThresholdSampler {
    fn should_process(&self, entry: &MetricEntry) -> bool {
        let rate = self.rate_for(entry.metric_type);
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        self.rng.lock().gen::<f64>() < rate
    }
}
