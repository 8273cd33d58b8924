//! Lifecycle observability counters. Pure observers — nothing here feeds
//! back into control flow.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct SearcherMetrics {
    new_searcher_opens: AtomicU64,
    max_warming_reached: AtomicU64,
    other_errors: AtomicU64,
    open_nanos: AtomicU64,
    open_count: AtomicU64,
    warm_nanos: AtomicU64,
    warm_count: AtomicU64,
}

impl SearcherMetrics {
    pub fn new() -> Self {
        SearcherMetrics::default()
    }

    pub(crate) fn record_open(&self, elapsed: Duration) {
        self.new_searcher_opens.fetch_add(1, Ordering::Relaxed);
        self.open_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.open_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_warm(&self, elapsed: Duration) {
        self.warm_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.warm_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_max_warming_reached(&self) {
        self.max_warming_reached.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.other_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn new_searcher_opens(&self) -> u64 {
        self.new_searcher_opens.load(Ordering::Relaxed)
    }

    pub fn max_warming_reached(&self) -> u64 {
        self.max_warming_reached.load(Ordering::Relaxed)
    }

    pub fn other_errors(&self) -> u64 {
        self.other_errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let open_count = self.open_count.load(Ordering::Relaxed);
        let warm_count = self.warm_count.load(Ordering::Relaxed);
        MetricsSnapshot {
            new_searcher_opens: self.new_searcher_opens.load(Ordering::Relaxed),
            max_warming_reached: self.max_warming_reached.load(Ordering::Relaxed),
            other_errors: self.other_errors.load(Ordering::Relaxed),
            avg_open_ms: avg_ms(self.open_nanos.load(Ordering::Relaxed), open_count),
            avg_warm_ms: avg_ms(self.warm_nanos.load(Ordering::Relaxed), warm_count),
            warm_count,
        }
    }
}

fn avg_ms(total_nanos: u64, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    (total_nanos as f64 / count as f64) / 1_000_000.0
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub new_searcher_opens: u64,
    pub max_warming_reached: u64,
    pub other_errors: u64,
    pub avg_open_ms: f64,
    pub avg_warm_ms: f64,
    pub warm_count: u64,
}
