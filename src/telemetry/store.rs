//! Thread-safe in-process metrics storage.
//!
//! Complements the `metrics` crate facade: values recorded here can be
//! snapshotted and serialized without installing a recorder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramSummary>,
}

/// Summary statistics for a histogram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl HistogramSummary {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Histogram with atomic fields. f64 values are stored as bits.
struct HistogramData {
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl HistogramData {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(f64::to_bits(0.0)),
            min: AtomicU64::new(f64::to_bits(f64::MAX)),
            max: AtomicU64::new(f64::to_bits(f64::MIN)),
        }
    }

    fn record(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        update_f64(&self.sum, |current| Some(current + value));
        update_f64(&self.min, |current| (value < current).then_some(value));
        update_f64(&self.max, |current| (value > current).then_some(value));
    }

    fn to_summary(&self) -> HistogramSummary {
        let count = self.count.load(Ordering::Relaxed);
        let sum = f64::from_bits(self.sum.load(Ordering::Relaxed));
        let min = f64::from_bits(self.min.load(Ordering::Relaxed));
        let max = f64::from_bits(self.max.load(Ordering::Relaxed));

        HistogramSummary {
            count,
            sum,
            min: if count == 0 { 0.0 } else { min },
            max: if count == 0 { 0.0 } else { max },
        }
    }
}

/// CAS loop over an f64 stored as bits. `None` from `f` leaves it unchanged.
fn update_f64(atomic: &AtomicU64, f: impl Fn(f64) -> Option<f64>) {
    let _ = atomic.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
        f(f64::from_bits(bits)).map(f64::to_bits)
    });
}

/// Thread-safe metrics store.
#[derive(Default)]
pub struct MetricsStore {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicU64>,
    histograms: DashMap<String, HistogramData>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by the given value.
    pub fn increment_counter(&self, name: &str, value: u64) {
        if let Some(counter) = self.counters.get(name) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    /// Adjust a gauge by `delta`.
    pub fn add_gauge(&self, name: &str, delta: f64) {
        let gauge = self
            .gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(f64::to_bits(0.0)));
        update_f64(&gauge, |current| Some(current + delta));
    }

    /// Set a gauge to the given value.
    pub fn set_gauge(&self, name: &str, value: f64) {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(f64::to_bits(value), Ordering::Relaxed);
    }

    /// Record a histogram observation.
    pub fn record_histogram(&self, name: &str, value: f64) {
        if let Some(histogram) = self.histograms.get(name) {
            histogram.record(value);
            return;
        }
        self.histograms
            .entry(name.to_string())
            .or_insert_with(HistogramData::new)
            .record(value);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> f64 {
        self.gauges
            .get(name)
            .map(|g| f64::from_bits(g.load(Ordering::Relaxed)))
            .unwrap_or(0.0)
    }

    /// Take a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
                .collect(),
            gauges: self
                .gauges
                .iter()
                .map(|entry| {
                    (
                        entry.key().clone(),
                        f64::from_bits(entry.value().load(Ordering::Relaxed)),
                    )
                })
                .collect(),
            histograms: self
                .histograms
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().to_summary()))
                .collect(),
        }
    }
}
