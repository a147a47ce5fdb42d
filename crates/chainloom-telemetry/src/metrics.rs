use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// One metric value captured by [`MetricsRecorder::snapshot`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    /// Counter total, gauge value, or histogram p50.
    pub value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub metric_type: MetricType,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Default)]
struct Counter(AtomicU64);

/// f64 stored as bits so it can be updated without a lock.
#[derive(Default)]
struct Gauge(AtomicU64);

impl Gauge {
    fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }

    fn add(&self, delta: f64) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

#[derive(Default)]
struct Histogram(Mutex<Vec<f64>>);

impl Histogram {
    fn summary(&self) -> HistogramSummary {
        let mut obs = self.0.lock().clone();
        if obs.is_empty() {
            return HistogramSummary::default();
        }
        obs.sort_by(f64::total_cmp);
        let count = obs.len();
        let at = |q: f64| obs[((count as f64 * q) as usize).min(count - 1)];
        HistogramSummary {
            count: count as u64,
            sum: obs.iter().sum(),
            p50: at(0.5),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

/// Metric name plus labels sorted by key.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> =
            labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn label_map(&self) -> BTreeMap<String, String> {
        self.labels.iter().cloned().collect()
    }
}

/// Read-mostly map: take the read lock on the hot path, upgrade only to
/// insert a new series.
fn with_series<T: Default, R>(map: &RwLock<HashMap<MetricKey, T>>, key: MetricKey, f: impl FnOnce(&T) -> R) -> R {
    if let Some(series) = map.read().get(&key) {
        return f(series);
    }
    let mut write = map.write();
    f(write.entry(key).or_default())
}

/// Thread-safe in-process metrics: counters, gauges and histograms keyed
/// by name and labels.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        with_series(&self.counters, MetricKey::new(name, labels), |c| {
            c.0.fetch_add(n, Ordering::Relaxed);
        });
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_series(&self.gauges, MetricKey::new(name, labels), |g| g.set(value));
    }

    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        with_series(&self.gauges, MetricKey::new(name, labels), |g| g.add(delta));
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_series(&self.histograms, MetricKey::new(name, labels), |h| h.0.lock().push(value));
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .read()
            .get(&MetricKey::new(name, labels))
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read()
            .get(&MetricKey::new(name, labels))
            .map_or(0, |c| c.0.load(Ordering::Relaxed))
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges
            .read()
            .get(&MetricKey::new(name, labels))
            .map_or(0.0, Gauge::get)
    }

    /// Capture every series at one timestamp, sorted by name then labels.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let timestamp = Utc::now();
        let sample = |key: &MetricKey, value: f64, metric_type: MetricType| MetricSample {
            timestamp,
            name: key.name.clone(),
            value,
            labels: key.label_map(),
            metric_type,
        };

        let mut samples: Vec<MetricSample> = Vec::new();
        samples.extend(
            self.counters
                .read()
                .iter()
                .map(|(k, c)| sample(k, c.0.load(Ordering::Relaxed) as f64, MetricType::Counter)),
        );
        samples.extend(
            self.gauges
                .read()
                .iter()
                .map(|(k, g)| sample(k, g.get(), MetricType::Gauge)),
        );
        samples.extend(
            self.histograms
                .read()
                .iter()
                .map(|(k, h)| sample(k, h.summary().p50, MetricType::Histogram)),
        );
        samples.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        samples
    }
}
