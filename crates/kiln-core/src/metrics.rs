//! Concurrent counter and timing aggregation.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Default)]
struct MetricsInner {
    counters: HashMap<String, u64>,
    timings: HashMap<String, Vec<Duration>>,
}

/// Registry of counters and timings keyed by dotted name
/// (e.g. `job.success`, `pipeline.run`).
///
/// Writes are commutative; read-side operations return snapshots and never
/// block submitters beyond the copy.
#[derive(Default)]
pub struct MetricsRegistry {
    inner: Mutex<MetricsInner>,
}

/// Aggregate view over one timing series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingSummary {
    pub count: usize,
    pub avg: Duration,
    pub max: Duration,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, name: &str) {
        self.inc_by(name, 1);
    }

    pub fn inc_by(&self, name: &str, value: u64) {
        let mut inner = self.lock();
        *inner.counters.entry(name.to_string()).or_insert(0) += value;
    }

    /// Current value of one counter (0 if never incremented).
    pub fn counter(&self, name: &str) -> u64 {
        self.lock().counters.get(name).copied().unwrap_or(0)
    }

    /// Snapshot of all counters.
    pub fn counters(&self) -> HashMap<String, u64> {
        self.lock().counters.clone()
    }

    pub fn record_timing(&self, name: &str, duration: Duration) {
        let mut inner = self.lock();
        inner
            .timings
            .entry(name.to_string())
            .or_default()
            .push(duration);
    }

    /// Snapshot of all timing series, aggregated.
    pub fn timings(&self) -> HashMap<String, TimingSummary> {
        let inner = self.lock();
        inner
            .timings
            .iter()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(name, samples)| {
                let total: Duration = samples.iter().sum();
                let max = samples.iter().max().copied().unwrap_or_default();
                (
                    name.clone(),
                    TimingSummary {
                        count: samples.len(),
                        avg: total / samples.len() as u32,
                        max,
                    },
                )
            })
            .collect()
    }

    /// Guard that records the elapsed time of a scope when dropped.
    pub fn timer<'a>(&'a self, name: &str) -> Timer<'a> {
        Timer {
            registry: self,
            name: name.to_string(),
            start: Instant::now(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Records a timing for its scope on drop.
pub struct Timer<'a> {
    registry: &'a MetricsRegistry,
    name: String,
    start: Instant,
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.registry
            .record_timing(&self.name, self.start.elapsed());
    }
}
